//! GitHub integration: the REST client and the Review Adapter that drives a
//! unit's pull request from open through merge.

pub mod github;
pub mod types;

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::github::client::GitHubClient;
    use crate::types::*;

    #[test]
    fn github_pr_serde_roundtrip() {
        let pr = GitHubPullRequest {
            number: 101,
            title: "Add feature X".to_string(),
            body: Some("Implements feature X".to_string()),
            state: PrState::Open,
            author: "alice".to_string(),
            head_branch: "feature-x".to_string(),
            base_branch: "main".to_string(),
            labels: vec![],
            reviewers: vec!["bob".to_string()],
            draft: false,
            mergeable: Some(true),
            additions: 50,
            deletions: 10,
            changed_files: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            merged_at: None,
            html_url: "https://github.com/owner/repo/pull/101".to_string(),
        };

        let json = serde_json::to_string(&pr).unwrap();
        let deserialized: GitHubPullRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.number, 101);
        assert_eq!(deserialized.state, PrState::Open);
        assert_eq!(deserialized.head_branch, "feature-x");
        assert_eq!(deserialized.additions, 50);
    }

    #[test]
    fn pr_state_serde() {
        let merged_json = serde_json::to_string(&PrState::Merged).unwrap();
        assert_eq!(merged_json, "\"merged\"");

        let merged: PrState = serde_json::from_str("\"merged\"").unwrap();
        assert_eq!(merged, PrState::Merged);
    }

    #[test]
    fn github_label_serde_roundtrip() {
        let label = GitHubLabel {
            name: "bug".to_string(),
            color: "d73a4a".to_string(),
            description: Some("Something isn't working".to_string()),
        };
        let json = serde_json::to_string(&label).unwrap();
        let deserialized: GitHubLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.name, "bug");
    }

    #[test]
    fn reaction_and_review_comment_serde_roundtrip() {
        let reaction = Reaction { content: "+1".to_string(), user: "alice".to_string(), created_at: Utc::now() };
        let json = serde_json::to_string(&reaction).unwrap();
        let deserialized: Reaction = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.content, "+1");

        let comment = ReviewComment {
            author: "bob".to_string(),
            body: "please add a test".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&comment).unwrap();
        let deserialized: ReviewComment = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.author, "bob");
    }

    #[test]
    fn check_run_completion_and_failure() {
        let passing = CheckRun { name: "ci".into(), status: "completed".into(), conclusion: Some("success".into()) };
        assert!(passing.is_complete());
        assert!(!passing.is_failure());

        let failing = CheckRun { name: "ci".into(), status: "completed".into(), conclusion: Some("failure".into()) };
        assert!(failing.is_failure());
    }

    #[test]
    fn github_config_serde_roundtrip() {
        let config = GitHubConfig {
            token: Some("ghp_test123".to_string()),
            owner: "myorg".to_string(),
            repo: "myrepo".to_string(),
        };

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: GitHubConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.owner, "myorg");
        assert_eq!(deserialized.repo, "myrepo");
        assert_eq!(deserialized.token.unwrap(), "ghp_test123");
    }

    // ---- GitHubClient creation ----

    #[tokio::test]
    async fn client_creation_with_config() {
        let config = GitHubConfig {
            token: Some("ghp_test_token".to_string()),
            owner: "testowner".to_string(),
            repo: "testrepo".to_string(),
        };

        let client = GitHubClient::new(config).unwrap();
        assert_eq!(client.owner(), "testowner");
        assert_eq!(client.repo(), "testrepo");
    }

    #[test]
    fn client_creation_missing_token() {
        let config = GitHubConfig {
            token: None,
            owner: "testowner".to_string(),
            repo: "testrepo".to_string(),
        };

        let result = GitHubClient::new(config);
        assert!(result.is_err());
    }
}
