//! Sampling temperature and reasoning budget per agent role.

use loomi_core::action::ActionKind;
use loomi_core::provider::{ModelClient, ModelRequest};

/// Reasoning budget for the orchestrator and the high-variation writers.
pub const EXTENDED_THINKING_BUDGET: u32 = 500;

/// Reasoning budget for everything else.
pub const DEFAULT_THINKING_BUDGET: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Orchestrator,
    Action(ActionKind),
}

impl AgentRole {
    pub fn temperature(&self) -> f32 {
        match self {
            AgentRole::Orchestrator => 0.5,
            AgentRole::Action(ActionKind::Knowledge) => 0.3,
            AgentRole::Action(ActionKind::Websearch) => 0.1,
            AgentRole::Action(kind) if kind.is_high_variation() => 0.6,
            AgentRole::Action(_) => 0.4,
        }
    }

    pub fn thinking_budget(&self) -> u32 {
        match self {
            AgentRole::Orchestrator => EXTENDED_THINKING_BUDGET,
            AgentRole::Action(kind) if kind.is_high_variation() => EXTENDED_THINKING_BUDGET,
            _ => DEFAULT_THINKING_BUDGET,
        }
    }

    /// Set the role's temperature, and its reasoning budget when `client`
    /// accepts one.
    pub fn tune(&self, request: ModelRequest, client: &dyn ModelClient) -> ModelRequest {
        let request = request.with_temperature(self.temperature());
        if client.supports_thinking() {
            request.with_thinking_budget(self.thinking_budget())
        } else {
            request
        }
    }

    /// Name used in logs and in the `agent` field of thought events.
    pub fn name(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Action(kind) => kind.slug(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedClient;

    #[test]
    fn temperature_table() {
        assert_eq!(AgentRole::Orchestrator.temperature(), 0.5);
        assert_eq!(AgentRole::Action(ActionKind::Knowledge).temperature(), 0.3);
        assert_eq!(AgentRole::Action(ActionKind::Websearch).temperature(), 0.1);
        assert_eq!(AgentRole::Action(ActionKind::XhsPost).temperature(), 0.6);
        assert_eq!(AgentRole::Action(ActionKind::Revision).temperature(), 0.6);
        assert_eq!(AgentRole::Action(ActionKind::Persona).temperature(), 0.4);
    }

    #[test]
    fn thinking_budget_table() {
        assert_eq!(AgentRole::Orchestrator.thinking_budget(), 500);
        assert_eq!(AgentRole::Action(ActionKind::TiktokScript).thinking_budget(), 500);
        assert_eq!(AgentRole::Action(ActionKind::Knowledge).thinking_budget(), 128);
        assert_eq!(AgentRole::Action(ActionKind::Persona).thinking_budget(), 128);
    }

    #[test]
    fn tune_sends_budget_only_when_supported() {
        let role = AgentRole::Action(ActionKind::XhsPost);
        let plain = ScriptedClient::new();
        let tuned = role.tune(ModelRequest::new("u1", "s1", Vec::new()), &plain);
        assert_eq!(tuned.temperature, Some(0.6));
        assert_eq!(tuned.thinking_budget, None);

        let thinking = ScriptedClient::new().with_thinking();
        let tuned = role.tune(ModelRequest::new("u1", "s1", Vec::new()), &thinking);
        assert_eq!(tuned.thinking_budget, Some(500));
    }

    #[test]
    fn names() {
        assert_eq!(AgentRole::Orchestrator.name(), "orchestrator");
        assert_eq!(AgentRole::Action(ActionKind::BrandAnalysis).name(), "brand_analysis");
    }
}
