//! The Worker: runs the Agent Adapter subprocess gateway and drives a single
//! unit's tasks, baseline checks, and branch push from inside its worktree.

pub mod agent_adapter;
pub mod prompts;
pub mod state_machine;
pub mod worker;
