// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The region-update contract the rendering layer implements.
//!
//! Every method returns how many elements matched the selector; zero means
//! the region is not on the current page, which is not an error.

use std::collections::BTreeMap;

pub trait Document: Send {
    fn set_text(&mut self, selector: &str, text: &str) -> usize;

    fn set_html(&mut self, selector: &str, html: &str) -> usize;

    fn set_image_src(&mut self, selector: &str, url: &str) -> usize;

    fn set_background(&mut self, selector: &str, url: &str) -> usize;

    fn set_href(&mut self, selector: &str, url: &str) -> usize;

    /// Put back the static content the page shipped with.
    fn restore_default(&mut self, selector: &str) -> usize;
}

/// What a region currently shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionState {
    pub text: Option<String>,
    pub html: Option<String>,
    pub image_src: Option<String>,
    pub background: Option<String>,
    pub href: Option<String>,
}

#[derive(Debug, Clone)]
struct Region {
    default: RegionState,
    current: RegionState,
}

/// In-memory [`Document`] keyed by selector.
///
/// Counts every write so callers can check that re-applying a value
/// touched nothing.
#[derive(Debug, Clone, Default)]
pub struct VirtualDocument {
    regions: BTreeMap<String, Region>,
    writes: usize,
}

impl VirtualDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region whose static content is `default_text`.
    pub fn with_region(mut self, selector: impl Into<String>, default_text: impl Into<String>) -> Self {
        self.add_region(selector, default_text);
        self
    }

    pub fn add_region(&mut self, selector: impl Into<String>, default_text: impl Into<String>) {
        let default = RegionState {
            text: Some(default_text.into()),
            ..Default::default()
        };
        self.regions.insert(
            selector.into(),
            Region {
                current: default.clone(),
                default,
            },
        );
    }

    #[must_use]
    pub fn region(&self, selector: &str) -> Option<&RegionState> {
        self.regions.get(selector).map(|r| &r.current)
    }

    #[must_use]
    pub fn text(&self, selector: &str) -> Option<&str> {
        self.region(selector).and_then(|r| r.text.as_deref())
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn write(&mut self, selector: &str, apply: impl FnOnce(&mut RegionState)) -> usize {
        match self.regions.get_mut(selector) {
            Some(region) => {
                apply(&mut region.current);
                self.writes += 1;
                1
            }
            None => 0,
        }
    }
}

impl Document for VirtualDocument {
    fn set_text(&mut self, selector: &str, text: &str) -> usize {
        self.write(selector, |r| {
            r.text = Some(text.to_string());
            r.html = None;
        })
    }

    fn set_html(&mut self, selector: &str, html: &str) -> usize {
        self.write(selector, |r| {
            r.html = Some(html.to_string());
            r.text = None;
        })
    }

    fn set_image_src(&mut self, selector: &str, url: &str) -> usize {
        self.write(selector, |r| r.image_src = Some(url.to_string()))
    }

    fn set_background(&mut self, selector: &str, url: &str) -> usize {
        self.write(selector, |r| r.background = Some(url.to_string()))
    }

    fn set_href(&mut self, selector: &str, url: &str) -> usize {
        self.write(selector, |r| r.href = Some(url.to_string()))
    }

    fn restore_default(&mut self, selector: &str) -> usize {
        match self.regions.get_mut(selector) {
            Some(region) => {
                region.current = region.default.clone();
                self.writes += 1;
                1
            }
            None => 0,
        }
    }
}
