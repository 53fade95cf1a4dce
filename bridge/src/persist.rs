use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};

use badge_common::DeviceState;

// Quiescence window for coalescing rapid mutations into one flash write.
pub const SAVE_QUIESCENCE_MS: u64 = 400;
pub const SAVE_RETRY_MS: u64 = 2_000;

pub struct StateStore {
    path: PathBuf,
    save_deadline_ms: Option<u64>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            save_deadline_ms: None,
        }
    }

    pub fn load(&self) -> DeviceState {
        match std::fs::read(&self.path) {
            Ok(raw) => match serde_json::from_slice::<DeviceState>(&raw) {
                Ok(mut state) => {
                    state.sanitize();
                    state
                }
                Err(err) => {
                    warn!("persisted light state is corrupt, using defaults: {err}");
                    DeviceState::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no persisted light state, using defaults");
                DeviceState::default()
            }
            Err(err) => {
                warn!("failed to read persisted light state, using defaults: {err}");
                DeviceState::default()
            }
        }
    }

    // The write only becomes visible under the final name once it is
    // complete; an interruption leaves the previous file intact.
    pub fn save(&self, state: &DeviceState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let staging = self.path.with_extension("tmp");
        let payload = serde_json::to_vec_pretty(state)?;
        std::fs::write(&staging, payload)
            .with_context(|| format!("failed to stage {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to commit {}", self.path.display()))?;
        Ok(())
    }

    // Each call slides the deadline forward, so a dial being turned becomes
    // a single write once the input goes quiet.
    pub fn queue_save(&mut self, now_ms: u64) {
        self.save_deadline_ms = Some(now_ms.saturating_add(SAVE_QUIESCENCE_MS));
    }

    pub fn has_pending(&self) -> bool {
        self.save_deadline_ms.is_some()
    }

    pub fn flush_pending(&mut self, state: &DeviceState, now_ms: u64) {
        let due = matches!(self.save_deadline_ms, Some(at) if now_ms >= at);
        if !due {
            return;
        }
        self.save_deadline_ms = None;

        if let Err(err) = self.save(state) {
            warn!("failed to persist light state, will retry: {err:#}");
            self.save_deadline_ms = Some(now_ms.saturating_add(SAVE_RETRY_MS));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use badge_common::LedEffect;

    fn sample_state() -> DeviceState {
        DeviceState {
            power: false,
            brightness: 17,
            hue: 300,
            saturation: 55,
            effect: LedEffect::Breathe,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("light_state.json"));

        let state = sample_state();
        store.save(&state).unwrap();

        assert_eq!(store.load(), state);
    }

    #[test]
    fn absent_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("light_state.json"));

        assert_eq!(store.load(), DeviceState::default());
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("light_state.json");
        std::fs::write(&path, b"{\"power\":tru").unwrap();

        let store = StateStore::new(path);
        assert_eq!(store.load(), DeviceState::default());
    }

    #[test]
    fn interrupted_write_leaves_previous_state_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("light_state.json");
        let store = StateStore::new(path.clone());

        let state = sample_state();
        store.save(&state).unwrap();

        // A write that died between serialize and commit leaves only the
        // staging file behind.
        std::fs::write(path.with_extension("tmp"), b"{\"power\":").unwrap();

        assert_eq!(store.load(), state);
    }

    #[test]
    fn rapid_mutations_coalesce_into_one_deferred_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("light_state.json");
        let mut store = StateStore::new(path.clone());
        let state = sample_state();

        store.queue_save(0);
        store.queue_save(300);

        store.flush_pending(&state, 399);
        assert!(!path.exists());

        // Quiet since the second change; the deadline from the first one no
        // longer applies.
        store.flush_pending(&state, 450);
        assert!(!path.exists());

        store.flush_pending(&state, 700);
        assert!(path.exists());
        assert!(!store.has_pending());
    }

    #[test]
    fn failed_write_is_retried_on_next_window() {
        let dir = tempfile::tempdir().unwrap();
        // Parent "occupied" is a file, so the save cannot succeed.
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"x").unwrap();

        let mut store = StateStore::new(blocker.join("light_state.json"));
        let state = sample_state();

        store.queue_save(0);
        store.flush_pending(&state, SAVE_QUIESCENCE_MS);

        assert!(store.has_pending());
    }
}
