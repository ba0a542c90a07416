//! Minimum Schedulable Block (MSB) domain model.
//!
//! # Responsibility
//! - Define the schedulable unit, its observations and constraint ranges.
//! - Derive the content checksum used as MSB identity.
//! - Provide single-MSB state transitions; OR-group side effects live in
//!   [`crate::model::program`].
//!
//! # Invariants
//! - `remaining` never goes below zero; decrements clamp.
//! - The checksum covers content only, never `remaining`, `removed` or
//!   `suspended`, so observing an MSB keeps its identity.
//! - Suspension is only reachable from the active state.

use crate::model::range::Range;
use crate::xml::XmlElement;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::error::Error;
use std::fmt::{Display, Formatter, Write as _};

/// Suffix appended to checksums of MSBs inside an OR group.
pub const OR_GROUP_CHECKSUM_SUFFIX: char = 'O';

/// One observation inside an MSB. Target and coordinate data are opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observation-sequence label, used as suspension point.
    pub label: String,
    pub instrument: Option<String>,
    pub target: Option<String>,
    pub waveband: Option<String>,
    pub coords_type: Option<String>,
    /// Unrecognised child elements, carried through untouched.
    #[serde(skip)]
    pub extra: Vec<XmlElement>,
}

/// Derived lifecycle state of an MSB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum MsbState {
    Active { remaining: u32 },
    Exhausted,
    Suspended { label: String },
    Removed,
}

impl Display for MsbState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active { remaining } => write!(f, "active (remaining={remaining})"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Suspended { label } => write!(f, "suspended at `{label}`"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// MSB lookup and transition errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsbError {
    /// No MSB with this checksum in the project. Non-fatal for callers.
    NotFound { project_id: String, checksum: String },
    /// Transition not allowed from the current state.
    InvalidTransition {
        checksum: String,
        action: &'static str,
        state: MsbState,
    },
    /// Suspension label is empty.
    InvalidLabel(String),
}

impl Display for MsbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound {
                project_id,
                checksum,
            } => write!(f, "MSB not found: project={project_id} checksum={checksum}"),
            Self::InvalidTransition {
                checksum,
                action,
                state,
            } => write!(f, "cannot {action} MSB {checksum}: MSB is {state}"),
            Self::InvalidLabel(label) => write!(f, "invalid suspension label `{label}`"),
        }
    }
}

impl Error for MsbError {}

/// Minimum Schedulable Block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Msb {
    /// Content-derived identity; see [`Msb::compute_checksum`].
    pub checksum: String,
    pub title: String,
    /// Lower value schedules first.
    pub priority: Option<i64>,
    /// Estimated duration of one repeat, in seconds.
    pub estimated_duration: Option<f64>,
    pub remaining: u32,
    /// Administratively removed (e.g. OR-group reorganization).
    pub removed: bool,
    /// Observation label where observing was suspended.
    pub suspended: Option<String>,
    /// Label of the containing OR group, if any.
    pub or_group: Option<String>,
    pub tau: Range,
    pub seeing: Range,
    /// Elevation limits in degrees; evaluated by callers with ephemeris data.
    pub elevation: Range,
    pub observations: Vec<Observation>,
    #[serde(skip)]
    pub extra: Vec<XmlElement>,
}

impl Msb {
    /// Returns the derived lifecycle state.
    pub fn state(&self) -> MsbState {
        if self.removed {
            MsbState::Removed
        } else if self.remaining == 0 {
            MsbState::Exhausted
        } else if let Some(label) = &self.suspended {
            MsbState::Suspended {
                label: label.clone(),
            }
        } else {
            MsbState::Active {
                remaining: self.remaining,
            }
        }
    }

    /// Whether the MSB can still be scheduled.
    pub fn is_observable(&self) -> bool {
        !self.removed && self.remaining > 0
    }

    /// Computes the content checksum (lowercase hex SHA-1, plus the OR-group
    /// suffix for OR members).
    pub fn compute_checksum(&self) -> String {
        let mut canonical = String::new();
        let _ = writeln!(canonical, "title={}", self.title.trim());
        let _ = writeln!(canonical, "priority={}", display_opt(self.priority));
        let _ = writeln!(
            canonical,
            "duration={}",
            display_opt(self.estimated_duration)
        );
        let _ = writeln!(canonical, "tau={}", self.tau);
        let _ = writeln!(canonical, "seeing={}", self.seeing);
        let _ = writeln!(canonical, "elevation={}", self.elevation);
        for obs in &self.observations {
            let _ = writeln!(
                canonical,
                "obs={}|{}|{}|{}|{}",
                obs.label,
                obs.instrument.as_deref().unwrap_or(""),
                obs.target.as_deref().unwrap_or(""),
                obs.waveband.as_deref().unwrap_or(""),
                obs.coords_type.as_deref().unwrap_or("")
            );
            for extra in &obs.extra {
                canonical_element(extra, &mut canonical);
            }
        }
        for extra in &self.extra {
            canonical_element(extra, &mut canonical);
        }

        let digest = Sha1::digest(canonical.as_bytes());
        let mut checksum = String::with_capacity(41);
        for byte in digest.iter() {
            let _ = write!(checksum, "{byte:02x}");
        }
        if self.or_group.is_some() {
            checksum.push(OR_GROUP_CHECKSUM_SUFFIX);
        }
        checksum
    }

    /// Recomputes and stores the checksum.
    pub fn refresh_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Records one observed repeat: decrement with floor zero and clear the
    /// suspension marker.
    pub fn record_done(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
        self.suspended = None;
    }

    /// Reverts one observed repeat.
    pub fn record_undo(&mut self) {
        self.remaining = self.remaining.saturating_add(1);
    }

    /// Marks the MSB suspended at `label`.
    ///
    /// # Errors
    /// - `InvalidLabel` for blank labels.
    /// - `InvalidTransition` unless the MSB is active.
    pub fn suspend(&mut self, label: &str) -> Result<(), MsbError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(MsbError::InvalidLabel(label.to_string()));
        }
        let state = self.state();
        if !matches!(state, MsbState::Active { .. }) {
            return Err(MsbError::InvalidTransition {
                checksum: self.checksum.clone(),
                action: "suspend",
                state,
            });
        }
        self.suspended = Some(label.to_string());
        Ok(())
    }

    /// Forces the MSB to zero remaining without OR-group handling.
    pub fn record_all_done(&mut self) {
        self.remaining = 0;
        self.suspended = None;
    }

    /// Distinct instruments in observation order.
    pub fn instruments(&self) -> Vec<String> {
        distinct(self.observations.iter().filter_map(|obs| obs.instrument.as_deref()))
    }

    /// Distinct targets in observation order.
    pub fn targets(&self) -> Vec<String> {
        distinct(self.observations.iter().filter_map(|obs| obs.target.as_deref()))
    }

    /// Distinct wavebands in observation order.
    pub fn wavebands(&self) -> Vec<String> {
        distinct(self.observations.iter().filter_map(|obs| obs.waveband.as_deref()))
    }

    /// Text indexed for free-text queries.
    pub fn search_text(&self) -> String {
        let mut parts = vec![self.title.clone()];
        parts.extend(self.targets());
        parts.extend(self.instruments());
        parts.extend(self.wavebands());
        parts.join(" ")
    }
}

fn display_opt<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !seen.iter().any(|existing| existing == value) {
            seen.push(value.to_string());
        }
    }
    seen
}

fn canonical_element(element: &XmlElement, out: &mut String) {
    let _ = write!(out, "<{}", element.name);
    for (key, value) in &element.attributes {
        let _ = write!(out, " {key}={value:?}");
    }
    let _ = write!(out, ">{}", element.text.trim());
    for child in &element.children {
        canonical_element(child, out);
    }
    let _ = writeln!(out, "</{}>", element.name);
}

#[cfg(test)]
mod tests {
    use super::{Msb, MsbError, MsbState, Observation, OR_GROUP_CHECKSUM_SUFFIX};
    use crate::model::range::Range;

    fn sample_msb() -> Msb {
        let mut msb = Msb {
            title: "Mars 850".to_string(),
            priority: Some(1),
            remaining: 1,
            tau: Range::bounded(0.0, 0.08),
            observations: vec![Observation {
                label: "obs1".to_string(),
                instrument: Some("SCUBA".to_string()),
                target: Some("Mars".to_string()),
                waveband: Some("850".to_string()),
                ..Observation::default()
            }],
            ..Msb::default()
        };
        msb.refresh_checksum();
        msb
    }

    #[test]
    fn checksum_ignores_progress_fields() {
        let msb = sample_msb();
        let mut observed = msb.clone();
        observed.record_done();
        observed.removed = true;
        assert_eq!(observed.compute_checksum(), msb.checksum);
        assert_eq!(msb.checksum.len(), 40);
    }

    #[test]
    fn checksum_tracks_content_and_or_membership() {
        let msb = sample_msb();
        let mut retitled = msb.clone();
        retitled.title = "Jupiter".to_string();
        assert_ne!(retitled.compute_checksum(), msb.checksum);

        let mut or_member = msb.clone();
        or_member.or_group = Some("or1".to_string());
        let checksum = or_member.compute_checksum();
        assert!(checksum.ends_with(OR_GROUP_CHECKSUM_SUFFIX));
        assert!(checksum.starts_with(&msb.checksum));
    }

    #[test]
    fn done_clamps_at_zero_and_clears_suspension() {
        let mut msb = sample_msb();
        msb.remaining = 1;
        msb.suspend("obs1").unwrap();
        msb.record_done();
        assert_eq!(msb.remaining, 0);
        assert_eq!(msb.suspended, None);
        msb.record_done();
        assert_eq!(msb.remaining, 0);
        assert_eq!(msb.state(), MsbState::Exhausted);
    }

    #[test]
    fn suspend_requires_active_state() {
        let mut msb = sample_msb();
        msb.record_all_done();
        let err = msb.suspend("obs1").unwrap_err();
        assert!(matches!(
            err,
            MsbError::InvalidTransition {
                action: "suspend",
                state: MsbState::Exhausted,
                ..
            }
        ));
        assert!(matches!(
            sample_msb().suspend("  "),
            Err(MsbError::InvalidLabel(_))
        ));
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_value(sample_msb().state()).unwrap();
        assert_eq!(json, serde_json::json!({"state": "active", "remaining": 1}));

        let suspended: MsbState =
            serde_json::from_str(r#"{"state":"suspended","label":"obs2"}"#).unwrap();
        assert_eq!(
            suspended,
            MsbState::Suspended {
                label: "obs2".to_string()
            }
        );
    }

    #[test]
    fn search_text_lists_distinct_fields() {
        let mut msb = sample_msb();
        msb.observations.push(msb.observations[0].clone());
        assert_eq!(msb.targets(), ["Mars"]);
        assert_eq!(msb.search_text(), "Mars 850 Mars SCUBA 850");
    }
}
