//! Multi-tab presence merge.

use roomcast_core::protocol::request::TabPresenceIntent;

/// Category of an outgoing room presence. Each category debounces with its
/// own delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceCategory {
    Available,
    Away,
    Unavailable,
}

/// The room's computed outgoing presence.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePresence {
    pub available: bool,
    pub show: Option<String>,
    pub status: Option<String>,
    pub badge: Option<String>,
}

impl EffectivePresence {
    pub fn category(&self) -> PresenceCategory {
        if !self.available {
            PresenceCategory::Unavailable
        } else if matches!(self.show.as_deref(), Some("away") | Some("xa") | Some("dnd")) {
            PresenceCategory::Away
        } else {
            PresenceCategory::Available
        }
    }
}

/// Merge all subscribed tabs' wishes into one outgoing presence.
///
/// Available wins if any tab is available. The show/status of the most
/// recently updated tab that is available and not away-like takes precedence
/// over an away one; when no tab qualifies, the most recently updated tab's
/// values are used.
pub fn merge_intents<'a, I>(intents: I) -> Option<EffectivePresence>
where
    I: IntoIterator<Item = &'a TabPresenceIntent>,
{
    let all: Vec<&TabPresenceIntent> = intents.into_iter().collect();
    if all.is_empty() {
        return None;
    }

    let available = all.iter().any(|i| i.available);
    let engaged = all
        .iter()
        .filter(|i| i.available && !i.is_away_like())
        .max_by_key(|i| i.updated_ms)
        .copied();
    let source = engaged.or_else(|| all.iter().max_by_key(|i| i.updated_ms).copied());

    source.map(|s| EffectivePresence {
        available,
        show: s.show.clone(),
        status: s.status.clone(),
        badge: s.badge.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(updated_ms: u64, available: bool, show: Option<&str>) -> TabPresenceIntent {
        TabPresenceIntent {
            updated_ms,
            available,
            show: show.map(str::to_string),
            status: None,
            badge: None,
        }
    }

    #[test]
    fn any_available_tab_wins() {
        let a = intent(100, false, None);
        let b = intent(50, true, None);
        let merged = merge_intents([&a, &b]).unwrap();
        assert!(merged.available);
    }

    #[test]
    fn engaged_tab_beats_more_recent_away_tab() {
        let engaged = intent(100, true, None);
        let away = intent(200, true, Some("away"));
        let merged = merge_intents([&engaged, &away]).unwrap();
        assert!(merged.available);
        assert_eq!(merged.show, None);
        assert_eq!(merged.category(), PresenceCategory::Available);
    }

    #[test]
    fn falls_back_to_most_recent_when_all_away() {
        let older = intent(100, true, Some("xa"));
        let newer = intent(200, true, Some("away"));
        let merged = merge_intents([&older, &newer]).unwrap();
        assert_eq!(merged.show.as_deref(), Some("away"));
        assert_eq!(merged.category(), PresenceCategory::Away);
    }

    #[test]
    fn no_intents_means_no_presence() {
        assert!(merge_intents(std::iter::empty::<&TabPresenceIntent>()).is_none());
    }
}
