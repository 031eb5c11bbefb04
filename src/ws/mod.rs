//! WebSocket surfaces: UI broadcast fan-out and the agent registry.

pub mod agent;
pub mod ui;

pub use agent::AgentRegistry;
pub use ui::{EventType, UiBroadcaster};
