//! Science program tree and OR-group reorganization.
//!
//! # Responsibility
//! - Parse/render the `SpProg` document (MSBs, OR folders, project metadata).
//! - Locate MSBs by checksum and apply transitions, including the sibling
//!   side effects of OR groups.
//!
//! # Invariants
//! - Checksums are recomputed on parse; submitted checksum attributes are
//!   ignored.
//! - Checksums are unique within one program.
//! - OR-group reorganization is deterministic (document order) and
//!   idempotent: re-running it after it fired removes nothing further.
//! - The optimistic-concurrency version token is never part of the document.

use crate::model::msb::{Msb, MsbError, Observation};
use crate::model::range::Range;
use crate::xml::{parse_document, render_document, XmlElement, XmlError};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter, Write as _};

const ROOT_ELEMENT: &str = "SpProg";
const MSB_ELEMENT: &str = "SpMSB";
const OR_ELEMENT: &str = "SpOR";
const OBS_ELEMENT: &str = "SpObs";

/// Malformed science program document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    Xml(XmlError),
    UnexpectedRoot(String),
    MissingProjectId,
    InvalidValue {
        element: String,
        value: String,
    },
    DuplicateChecksum(String),
}

impl Display for ProgramError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xml(err) => write!(f, "{err}"),
            Self::UnexpectedRoot(name) => {
                write!(f, "expected `{ROOT_ELEMENT}` root element, found `{name}`")
            }
            Self::MissingProjectId => write!(f, "science program has no projectID"),
            Self::InvalidValue { element, value } => {
                write!(f, "invalid value `{value}` for `{element}`")
            }
            Self::DuplicateChecksum(checksum) => {
                write!(f, "science program contains duplicate MSB {checksum}")
            }
        }
    }
}

impl Error for ProgramError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Xml(err) => Some(err),
            _ => None,
        }
    }
}

impl From<XmlError> for ProgramError {
    fn from(value: XmlError) -> Self {
        Self::Xml(value)
    }
}

/// OR folder: completing `number_of_items` members satisfies the group.
#[derive(Debug, Clone, PartialEq)]
pub struct OrGroup {
    pub label: String,
    pub number_of_items: u32,
    pub msbs: Vec<Msb>,
    /// Non-MSB children, each with its position among the group's children.
    pub others: Vec<(usize, XmlElement)>,
}

impl OrGroup {
    /// Removes every still-observable member once enough members are
    /// exhausted. Returns the checksums removed by this call.
    pub fn reorganize(&mut self) -> Vec<String> {
        let completed = self
            .msbs
            .iter()
            .filter(|msb| !msb.removed && msb.remaining == 0)
            .count();
        if completed < self.number_of_items as usize {
            return Vec::new();
        }

        let mut removed = Vec::new();
        for msb in self.msbs.iter_mut() {
            if !msb.removed && msb.remaining > 0 {
                msb.removed = true;
                msb.suspended = None;
                removed.push(msb.checksum.clone());
            }
        }
        removed
    }
}

/// Top-level entry of a science program.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramItem {
    Msb(Msb),
    Or(OrGroup),
    /// Unrecognised element carried through untouched.
    Other(XmlElement),
}

/// Position of an MSB inside the program tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    TopLevel(usize),
    InOr(usize, usize),
}

/// Outcome of one transition, used for history correlation and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionEffect {
    pub checksum: String,
    pub remaining_before: u32,
    pub remaining_after: u32,
    /// OR siblings removed by this transition.
    pub or_removed: Vec<String>,
    /// OR siblings restored by this transition.
    pub or_restored: Vec<String>,
}

/// Science program: MSB tree plus project metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ScienceProgram {
    pub project_id: String,
    pub ot_version: Option<String>,
    pub items: Vec<ProgramItem>,
}

impl ScienceProgram {
    /// Parses an `SpProg` document.
    ///
    /// # Errors
    /// - Malformed XML or unexpected root element.
    /// - Missing `projectID`.
    /// - Invalid numeric values or constraint ranges.
    /// - Two MSBs with the same content checksum.
    pub fn parse(xml: &str) -> Result<Self, ProgramError> {
        let root = parse_document(xml)?;
        if root.name != ROOT_ELEMENT {
            return Err(ProgramError::UnexpectedRoot(root.name));
        }

        let project_id = root
            .child_text("projectID")
            .ok_or(ProgramError::MissingProjectId)?
            .to_uppercase();
        let ot_version = root.child_text("ot_version").map(str::to_string);

        let mut items = Vec::new();
        let mut or_index = 0;
        for child in &root.children {
            match child.name.as_str() {
                "projectID" | "ot_version" => {}
                MSB_ELEMENT => items.push(ProgramItem::Msb(parse_msb(child, None)?)),
                OR_ELEMENT => {
                    or_index += 1;
                    items.push(ProgramItem::Or(parse_or_group(child, or_index)?));
                }
                _ => items.push(ProgramItem::Other(child.clone())),
            }
        }

        let program = Self {
            project_id,
            ot_version,
            items,
        };
        program.validate()?;
        Ok(program)
    }

    /// Renders the program as an `SpProg` document.
    pub fn to_xml(&self) -> Result<String, ProgramError> {
        Ok(render_document(&self.to_element())?)
    }

    /// Renders a document containing only the MSB with `checksum`.
    pub fn msb_document(&self, checksum: &str) -> Result<Option<String>, ProgramError> {
        let Some(msb) = self.find_msb(checksum) else {
            return Ok(None);
        };
        let root = self.header_element().with_child(msb_to_element(msb));
        Ok(Some(render_document(&root)?))
    }

    /// Iterates over every MSB in document order.
    pub fn msbs(&self) -> impl Iterator<Item = &Msb> {
        self.items.iter().flat_map(|item| match item {
            ProgramItem::Msb(msb) => std::slice::from_ref(msb).iter(),
            ProgramItem::Or(group) => group.msbs.iter(),
            ProgramItem::Other(_) => (&[] as &[Msb]).iter(),
        })
    }

    pub fn find_msb(&self, checksum: &str) -> Option<&Msb> {
        self.msbs().find(|msb| msb.checksum == checksum)
    }

    /// Decrements remaining; may trigger OR-group reorganization.
    pub fn mark_done(&mut self, checksum: &str) -> Result<TransitionEffect, MsbError> {
        let (msb, slot) = self.msb_mut(checksum)?;
        let mut effect = begin_effect(msb);
        msb.record_done();
        effect.remaining_after = msb.remaining;

        if let (Slot::InOr(group_index, _), 0) = (slot, effect.remaining_after) {
            if let Some(group) = self.or_group_mut(group_index) {
                effect.or_removed = group.reorganize();
            }
        }
        log::debug!(
            "event=msb_done module=program project={} checksum={} remaining={} or_removed={}",
            self.project_id,
            checksum,
            effect.remaining_after,
            effect.or_removed.len()
        );
        Ok(effect)
    }

    /// Increments remaining and restores the OR siblings listed in `restore`.
    pub fn mark_undo(
        &mut self,
        checksum: &str,
        restore: &[String],
    ) -> Result<TransitionEffect, MsbError> {
        let (msb, slot) = self.msb_mut(checksum)?;
        let mut effect = begin_effect(msb);
        msb.record_undo();
        effect.remaining_after = msb.remaining;

        if let Slot::InOr(group_index, _) = slot {
            if let Some(group) = self.or_group_mut(group_index) {
                for sibling in group.msbs.iter_mut() {
                    if sibling.removed && restore.contains(&sibling.checksum) {
                        sibling.removed = false;
                        effect.or_restored.push(sibling.checksum.clone());
                    }
                }
            }
        }
        Ok(effect)
    }

    /// Marks the MSB suspended at `label`.
    pub fn mark_suspended(
        &mut self,
        checksum: &str,
        label: &str,
    ) -> Result<TransitionEffect, MsbError> {
        let (msb, _) = self.msb_mut(checksum)?;
        let mut effect = begin_effect(msb);
        msb.suspend(label)?;
        effect.remaining_after = msb.remaining;
        Ok(effect)
    }

    /// Forces remaining to zero without OR-group reorganization.
    pub fn mark_all_done(&mut self, checksum: &str) -> Result<TransitionEffect, MsbError> {
        let (msb, _) = self.msb_mut(checksum)?;
        let mut effect = begin_effect(msb);
        msb.record_all_done();
        effect.remaining_after = msb.remaining;
        Ok(effect)
    }

    /// Validates the MSB exists; rejection does not change state.
    pub fn mark_rejected(&mut self, checksum: &str) -> Result<TransitionEffect, MsbError> {
        self.unchanged(checksum)
    }

    /// Effect of a transition that leaves the MSB as it is.
    pub fn unchanged(&mut self, checksum: &str) -> Result<TransitionEffect, MsbError> {
        let (msb, _) = self.msb_mut(checksum)?;
        Ok(begin_effect(msb))
    }

    /// Human-readable program summary returned on store.
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Project: {}", self.project_id);
        if let Some(version) = &self.ot_version {
            let _ = writeln!(out, "OT version: {version}");
        }
        let total = self.msbs().count();
        let active = self.msbs().filter(|msb| msb.is_observable()).count();
        let _ = writeln!(out, "Number of MSBs: {total} ({active} observable)");

        for item in &self.items {
            match item {
                ProgramItem::Msb(msb) => summary_line(&mut out, msb, ""),
                ProgramItem::Or(group) => {
                    let _ = writeln!(
                        out,
                        "OR group {} (choose {}):",
                        group.label, group.number_of_items
                    );
                    for msb in &group.msbs {
                        summary_line(&mut out, msb, "  ");
                    }
                }
                ProgramItem::Other(_) => {}
            }
        }
        out
    }

    fn validate(&self) -> Result<(), ProgramError> {
        let mut seen = HashSet::new();
        for msb in self.msbs() {
            if !seen.insert(msb.checksum.as_str()) {
                return Err(ProgramError::DuplicateChecksum(msb.checksum.clone()));
            }
        }
        Ok(())
    }

    fn locate(&self, checksum: &str) -> Option<Slot> {
        self.items
            .iter()
            .enumerate()
            .find_map(|(index, item)| match item {
                ProgramItem::Msb(msb) if msb.checksum == checksum => Some(Slot::TopLevel(index)),
                ProgramItem::Or(group) => group
                    .msbs
                    .iter()
                    .position(|msb| msb.checksum == checksum)
                    .map(|member| Slot::InOr(index, member)),
                _ => None,
            })
    }

    fn msb_mut(&mut self, checksum: &str) -> Result<(&mut Msb, Slot), MsbError> {
        let not_found = || MsbError::NotFound {
            project_id: self.project_id.clone(),
            checksum: checksum.to_string(),
        };
        let slot = self.locate(checksum).ok_or_else(not_found)?;
        let msb = match slot {
            Slot::TopLevel(index) => match self.items.get_mut(index) {
                Some(ProgramItem::Msb(msb)) => Some(msb),
                _ => None,
            },
            Slot::InOr(index, member) => match self.items.get_mut(index) {
                Some(ProgramItem::Or(group)) => group.msbs.get_mut(member),
                _ => None,
            },
        };
        match msb {
            Some(msb) => Ok((msb, slot)),
            None => Err(MsbError::NotFound {
                project_id: self.project_id.clone(),
                checksum: checksum.to_string(),
            }),
        }
    }

    fn or_group_mut(&mut self, index: usize) -> Option<&mut OrGroup> {
        match self.items.get_mut(index) {
            Some(ProgramItem::Or(group)) => Some(group),
            _ => None,
        }
    }

    fn header_element(&self) -> XmlElement {
        let mut root = XmlElement::new(ROOT_ELEMENT);
        root.push_text_child("projectID", Some(&self.project_id));
        root.push_text_child("ot_version", self.ot_version.as_ref());
        root
    }

    fn to_element(&self) -> XmlElement {
        let mut root = self.header_element();
        for item in &self.items {
            match item {
                ProgramItem::Msb(msb) => root.children.push(msb_to_element(msb)),
                ProgramItem::Or(group) => {
                    let mut element = XmlElement::new(OR_ELEMENT)
                        .with_attr("label", group.label.clone())
                        .with_attr("numberOfItems", group.number_of_items.to_string());
                    element.children.extend(group.msbs.iter().map(msb_to_element));
                    for (position, other) in &group.others {
                        let position = (*position).min(element.children.len());
                        element.children.insert(position, other.clone());
                    }
                    root.children.push(element);
                }
                ProgramItem::Other(element) => root.children.push(element.clone()),
            }
        }
        root
    }
}

fn begin_effect(msb: &Msb) -> TransitionEffect {
    TransitionEffect {
        checksum: msb.checksum.clone(),
        remaining_before: msb.remaining,
        remaining_after: msb.remaining,
        ..TransitionEffect::default()
    }
}

fn summary_line(out: &mut String, msb: &Msb, indent: &str) {
    let _ = writeln!(
        out,
        "{indent}{} [{}] remaining={}{}{} instruments={} targets={}",
        msb.title,
        msb.checksum,
        msb.remaining,
        if msb.removed { " REMOVED" } else { "" },
        msb.suspended
            .as_deref()
            .map(|label| format!(" suspended@{label}"))
            .unwrap_or_default(),
        msb.instruments().join(","),
        msb.targets().join(",")
    );
}

fn parse_or_group(element: &XmlElement, index: usize) -> Result<OrGroup, ProgramError> {
    let label = element
        .attr("label")
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("or{index}"));
    let number_of_items = match element.attr("numberOfItems") {
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(value) if value > 0 => value,
            _ => {
                return Err(ProgramError::InvalidValue {
                    element: "numberOfItems".to_string(),
                    value: raw.to_string(),
                })
            }
        },
        None => 1,
    };

    let mut msbs = Vec::new();
    let mut others = Vec::new();
    for (position, child) in element.children.iter().enumerate() {
        if child.name == MSB_ELEMENT {
            msbs.push(parse_msb(child, Some(&label))?);
        } else {
            others.push((position, child.clone()));
        }
    }

    Ok(OrGroup {
        label,
        number_of_items,
        msbs,
        others,
    })
}

fn parse_msb(element: &XmlElement, or_group: Option<&str>) -> Result<Msb, ProgramError> {
    let mut msb = Msb {
        or_group: or_group.map(str::to_string),
        ..Msb::default()
    };

    let remaining: i64 = parse_number(element.attr("remaining"), "remaining")?.unwrap_or(1);
    if remaining < 0 {
        msb.removed = true;
        msb.remaining = 0;
    } else {
        msb.remaining = u32::try_from(remaining).map_err(|_| ProgramError::InvalidValue {
            element: "remaining".to_string(),
            value: remaining.to_string(),
        })?;
    }
    msb.removed |= matches!(element.attr("removed"), Some("true" | "1"));
    msb.suspended = element
        .attr("suspended")
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string);

    for child in &element.children {
        match child.name.as_str() {
            "title" => msb.title = child.trimmed_text().to_string(),
            "priority" => msb.priority = parse_number(Some(child.trimmed_text()), "priority")?,
            "estimatedDuration" => {
                msb.estimated_duration =
                    parse_number(Some(child.trimmed_text()), "estimatedDuration")?
            }
            "SpSiteQualityObsComp" => {
                if let Some(tau) = child.child("csoTau") {
                    msb.tau = parse_range(tau)?;
                }
                if let Some(seeing) = child.child("seeing") {
                    msb.seeing = parse_range(seeing)?;
                }
            }
            "SpSchedConstObsComp" => {
                if let Some(elevation) = child.child("elevation") {
                    msb.elevation = parse_range(elevation)?;
                }
            }
            OBS_ELEMENT => {
                let index = msb.observations.len() + 1;
                msb.observations.push(parse_observation(child, index));
            }
            _ => msb.extra.push(child.clone()),
        }
    }

    msb.refresh_checksum();
    Ok(msb)
}

fn parse_observation(element: &XmlElement, index: usize) -> Observation {
    let mut obs = Observation {
        label: element
            .attr("label")
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("obs{index}")),
        ..Observation::default()
    };
    for child in &element.children {
        let text = Some(child.trimmed_text())
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        match child.name.as_str() {
            "instrument" => obs.instrument = text,
            "target" => obs.target = text,
            "waveband" => obs.waveband = text,
            "coordstype" => obs.coords_type = text,
            _ => obs.extra.push(child.clone()),
        }
    }
    obs
}

/// Parses a `<x><min>a</min><max>b</max></x>` range element.
pub(crate) fn parse_range(element: &XmlElement) -> Result<Range, ProgramError> {
    Ok(Range::new(
        parse_number(element.child_text("min"), &format!("{}/min", element.name))?,
        parse_number(element.child_text("max"), &format!("{}/max", element.name))?,
    ))
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<&str>,
    element: &str,
) -> Result<Option<T>, ProgramError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProgramError::InvalidValue {
                element: element.to_string(),
                value: value.to_string(),
            }),
        None => Ok(None),
    }
}

fn range_element(name: &str, range: &Range) -> Option<XmlElement> {
    if range.is_open() {
        return None;
    }
    let mut element = XmlElement::new(name);
    element.push_text_child("min", range.min);
    element.push_text_child("max", range.max);
    Some(element)
}

fn msb_to_element(msb: &Msb) -> XmlElement {
    let mut element = XmlElement::new(MSB_ELEMENT)
        .with_attr("checksum", msb.checksum.clone())
        .with_attr("remaining", msb.remaining.to_string());
    if msb.removed {
        element = element.with_attr("removed", "true");
    }
    if let Some(label) = &msb.suspended {
        element = element.with_attr("suspended", label.clone());
    }

    element.push_text_child("title", Some(&msb.title));
    element.push_text_child("priority", msb.priority);
    element.push_text_child("estimatedDuration", msb.estimated_duration);

    let site_quality: Vec<XmlElement> = [
        range_element("csoTau", &msb.tau),
        range_element("seeing", &msb.seeing),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !site_quality.is_empty() {
        let mut component = XmlElement::new("SpSiteQualityObsComp");
        component.children = site_quality;
        element.children.push(component);
    }
    if let Some(elevation) = range_element("elevation", &msb.elevation) {
        element
            .children
            .push(XmlElement::new("SpSchedConstObsComp").with_child(elevation));
    }

    for obs in &msb.observations {
        let mut obs_element = XmlElement::new(OBS_ELEMENT).with_attr("label", obs.label.clone());
        obs_element.push_text_child("instrument", obs.instrument.as_ref());
        obs_element.push_text_child("target", obs.target.as_ref());
        obs_element.push_text_child("waveband", obs.waveband.as_ref());
        obs_element.push_text_child("coordstype", obs.coords_type.as_ref());
        obs_element.children.extend(obs.extra.iter().cloned());
        element.children.push(obs_element);
    }
    element.children.extend(msb.extra.iter().cloned());
    element
}
