//! The stage contract exposed to stage implementers (§6).
//!
//! Concrete stage business logic (project analysis, architecture, development,
//! etc.) is out of scope for the core; this module only defines the interface the
//! Supervisor and Strategy drive against.

use async_trait::async_trait;
use serde_json::Value;

use crate::artemis::card::Card;
use crate::artemis::context::Context;

pub type StageOutcome = Result<Value, String>;

#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, card: &Card, context: &Context) -> StageOutcome;

    fn get_stage_name(&self) -> &str;
}

/// Reads the `status` key every result doc must carry.
pub fn result_status(result: &Value) -> Option<&str> {
    result.get("status").and_then(Value::as_str)
}
