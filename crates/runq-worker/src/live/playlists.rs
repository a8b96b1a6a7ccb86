//! Tracks which of the expected manifests the engine has written.

use std::collections::BTreeSet;

use runq_media::hls;

#[derive(Debug, Clone)]
pub struct PlaylistTracker {
    expected: BTreeSet<String>,
    created: BTreeSet<String>,
}

impl PlaylistTracker {
    /// Expect the master manifest plus one manifest per output.
    pub fn new(outputs: usize) -> Self {
        Self {
            expected: hls::expected_playlists(outputs),
            created: BTreeSet::new(),
        }
    }

    /// Record a manifest as created. Returns true when this completes the set.
    ///
    /// Names outside the expected set are ignored and return false.
    pub fn observe(&mut self, name: &str) -> bool {
        if !self.expected.contains(name) {
            return false;
        }
        let was_complete = self.all_created();
        self.created.insert(name.to_string());
        !was_complete && self.all_created()
    }

    pub fn is_expected(&self, name: &str) -> bool {
        self.expected.contains(name)
    }

    pub fn all_created(&self) -> bool {
        self.created.len() == self.expected.len()
    }

    /// Expected manifests not seen yet.
    pub fn missing(&self) -> Vec<&str> {
        self.expected
            .difference(&self.created)
            .map(String::as_str)
            .collect()
    }
}
