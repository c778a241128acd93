//! Integration tests for GitHub client construction. These don't hit the
//! network — no valid token is configured in CI, so everything here
//! exercises construction and type plumbing rather than live API calls.

use at_integrations::github::client::GitHubClient;
use at_integrations::types::GitHubConfig;

fn test_config() -> GitHubConfig {
    GitHubConfig {
        token: Some("ghp_faketoken".to_string()),
        owner: "test-owner".to_string(),
        repo: "test-repo".to_string(),
    }
}

#[test]
fn client_builds_from_explicit_config() {
    let client = GitHubClient::new(test_config()).expect("client should build with a token present");
    assert_eq!(client.owner(), "test-owner");
    assert_eq!(client.repo(), "test-repo");
}

#[test]
fn client_construction_fails_without_token() {
    let config = GitHubConfig { token: None, ..test_config() };
    let err = GitHubClient::new(config).unwrap_err();
    assert!(err.to_string().to_lowercase().contains("token"));
}

#[test]
fn client_from_env_requires_all_three_vars() {
    std::env::remove_var("GITHUB_TOKEN");
    std::env::remove_var("GITHUB_OWNER");
    std::env::remove_var("GITHUB_REPO");
    let result = GitHubClient::new_from_env();
    assert!(result.is_err());
}
