//! Behavioural scenarios for agent and cloud identifier resolution.

mod identifier;
