//! Event trait definition for type-safe publishing.

use serde::{de::DeserializeOwned, Serialize};

use crate::topic::derive_topic;

/// Trait for payload types bound to a fixed event type.
///
/// # Example
///
/// ```rust
/// use serde::{Serialize, Deserialize};
/// use skillhub_events::Event;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// pub struct SkillCreated {
///     pub skill_id: String,
///     pub title: String,
/// }
///
/// impl Event for SkillCreated {
///     const EVENT_TYPE: &'static str = "skill.created";
/// }
///
/// assert_eq!(SkillCreated::topic(), "skill_created");
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Dot-delimited event type, e.g. `booking.created`.
    const EVENT_TYPE: &'static str;

    /// Stream-channel topic for this event type.
    #[must_use]
    fn topic() -> String {
        derive_topic(Self::EVENT_TYPE)
    }
}
