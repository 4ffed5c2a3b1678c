//! Presence registry: opaque per-client state with clock-gated updates.
//!
//! Clients announce themselves under short-lived numeric ids; an entry with
//! the literal `null` state removes a client. Clocks resolve races between
//! late and fresh updates.

use std::collections::HashMap;
use std::sync::Mutex;

use coderoom_core::protocol::{PresenceEntry, PresenceUpdate};

#[derive(Default)]
pub struct PresenceRegistry {
    state: Mutex<PresenceState>,
}

#[derive(Default)]
struct PresenceState {
    states: HashMap<u64, String>,
    clocks: HashMap<u64, u64>,
}

impl PresenceRegistry {
    /// Applies an incoming update and returns the entries that were
    /// accepted, i.e. the ones worth re-broadcasting.
    pub fn apply(&self, update: &PresenceUpdate) -> PresenceUpdate {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut accepted = Vec::new();

        for entry in &update.entries {
            let known_clock = state.clocks.get(&entry.client_id).copied();
            let fresh = match known_clock {
                None => true,
                Some(clock) if entry.clock > clock => true,
                // Same-clock removals win over the state they remove.
                Some(clock) => {
                    entry.clock == clock
                        && entry.is_removal()
                        && state.states.contains_key(&entry.client_id)
                }
            };
            if !fresh {
                continue;
            }

            state.clocks.insert(entry.client_id, entry.clock);
            if entry.is_removal() {
                state.states.remove(&entry.client_id);
            } else {
                state
                    .states
                    .insert(entry.client_id, entry.state.clone());
            }
            accepted.push(entry.clone());
        }

        PresenceUpdate::new(accepted)
    }

    /// Revokes the given clients (socket teardown), returning the removal
    /// update to broadcast. Clients without live state are skipped.
    pub fn remove_clients(&self, client_ids: &[u64]) -> PresenceUpdate {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();

        for client_id in client_ids {
            if state.states.remove(client_id).is_none() {
                continue;
            }
            let clock = state
                .clocks
                .get(client_id)
                .copied()
                .unwrap_or_default()
                .saturating_add(1);
            state.clocks.insert(*client_id, clock);
            removed.push(PresenceEntry::removal(*client_id, clock));
        }

        PresenceUpdate::new(removed)
    }

    /// Current state of every present client, for the connect-time snapshot.
    pub fn snapshot(&self) -> PresenceUpdate {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<PresenceEntry> = state
            .states
            .iter()
            .map(|(client_id, json)| PresenceEntry {
                client_id: *client_id,
                clock: state.clocks.get(client_id).copied().unwrap_or_default(),
                state: json.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.client_id);
        PresenceUpdate::new(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.states.clear();
        state.clocks.clear();
    }
}
