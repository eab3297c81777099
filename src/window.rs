// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Registry of tracked guest windows.
//!
//! The platform window-enumeration layer (outside this crate) feeds this
//! registry; the capture loop reads it every iteration and the buffer
//! manager reclaims buffers for ids that drop out of the active set.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::capture::Rect;
use crate::protocol::{unix_millis, Message, WindowMetadata};

/// State of one tracked window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowInfo {
    pub window_id: u64,
    pub title: String,
    /// Window bounds in desktop coordinates
    pub rect: Rect,
    pub scale_factor: f64,
    pub is_resizable: bool,
    pub is_minimized: bool,
}

impl WindowInfo {
    /// Metadata notification for the host, stamped with the current time.
    pub fn metadata_message(&self) -> Message {
        Message::WindowMetadata(WindowMetadata {
            timestamp: unix_millis(),
            window_id: self.window_id,
            title: self.title.clone(),
            x: self.rect.x,
            y: self.rect.y,
            width: self.rect.width,
            height: self.rect.height,
            scale_factor: self.scale_factor,
            is_resizable: self.is_resizable,
            is_minimized: self.is_minimized,
        })
    }
}

/// Thread-safe window_id → WindowInfo map.
#[derive(Default)]
pub struct WindowRegistry {
    windows: Mutex<HashMap<u64, WindowInfo>>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a window. Returns `true` when the stored state
    /// changed (callers emit metadata only on change).
    pub fn upsert(&self, info: WindowInfo) -> bool {
        let mut windows = self.windows.lock().unwrap();
        match windows.get(&info.window_id) {
            Some(existing) if *existing == info => false,
            _ => {
                windows.insert(info.window_id, info);
                true
            }
        }
    }

    /// Forget a window. Returns `true` when it was tracked.
    pub fn remove(&self, window_id: u64) -> bool {
        self.windows.lock().unwrap().remove(&window_id).is_some()
    }

    pub fn get(&self, window_id: u64) -> Option<WindowInfo> {
        self.windows.lock().unwrap().get(&window_id).cloned()
    }

    /// Ids of all tracked windows, for stale-buffer cleanup.
    pub fn active_ids(&self) -> HashSet<u64> {
        self.windows.lock().unwrap().keys().copied().collect()
    }

    /// Point-in-time copy of all tracked windows.
    pub fn snapshot(&self) -> Vec<WindowInfo> {
        self.windows.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(id: u64, minimized: bool) -> WindowInfo {
        WindowInfo {
            window_id: id,
            title: format!("window-{id}"),
            rect: Rect::new(10, 20, 640, 480),
            scale_factor: 1.0,
            is_resizable: true,
            is_minimized: minimized,
        }
    }

    #[test]
    fn upsert_reports_changes_only() {
        let registry = WindowRegistry::new();
        assert!(registry.upsert(window(1, false)));
        assert!(!registry.upsert(window(1, false)));
        assert!(registry.upsert(window(1, true)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn active_ids_follow_membership() {
        let registry = WindowRegistry::new();
        registry.upsert(window(1, false));
        registry.upsert(window(2, false));
        registry.remove(1);
        let ids = registry.active_ids();
        assert!(!ids.contains(&1));
        assert!(ids.contains(&2));
    }

    #[test]
    fn metadata_message_mirrors_info() {
        let info = window(5, false);
        match info.metadata_message() {
            Message::WindowMetadata(m) => {
                assert_eq!(m.window_id, 5);
                assert_eq!(m.width, 640);
                assert_eq!(m.title, "window-5");
                assert!(!m.is_minimized);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
