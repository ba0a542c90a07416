//! XML result documents returned to callers.
//!
//! # Responsibility
//! - Render query results (`QueryResult`) with the constraints the store
//!   could not evaluate.
//! - Render MSB history timelines (`SpMSBSummaries`).

use crate::clock::format_ut_datetime;
use crate::model::range::Range;
use crate::query::MsbQuery;
use crate::repo::done_repo::{MsbHistory, MsbSnapshot};
use crate::repo::msb_repo::MsbSummary;
use crate::xml::{render_document, XmlElement, XmlError};

/// Renders a query result.
///
/// Elevation/airmass and the reference date are echoed in a
/// `<DeferredConstraints>` element; callers evaluate them with ephemeris
/// data.
pub fn query_result_document(
    query: &MsbQuery,
    summaries: &[MsbSummary],
) -> Result<String, XmlError> {
    let mut root = XmlElement::new("QueryResult");
    let mut deferred = XmlElement::new("DeferredConstraints");
    if let Some(elevation) = &query.elevation {
        deferred.children.push(range_element("elevation", elevation));
    }
    deferred.push_text_child("date", query.date.as_ref());
    if !deferred.children.is_empty() {
        root.children.push(deferred);
    }

    for (index, summary) in summaries.iter().enumerate() {
        root.children.push(summary_element(index + 1, summary));
    }
    render_document(&root)
}

/// Renders history timelines, one `SpMSBSummary` per MSB.
pub fn history_document(histories: &[MsbHistory]) -> Result<String, XmlError> {
    let mut root = XmlElement::new("SpMSBSummaries");
    for history in histories {
        let mut element = XmlElement::new("SpMSBSummary")
            .with_attr("projectid", history.project_id.clone())
            .with_attr("checksum", history.checksum.clone());
        push_snapshot(&mut element, &history.snapshot);
        for entry in &history.entries {
            let comment = &entry.comment;
            let mut node = XmlElement::new("comment")
                .with_attr("status", comment.status().as_str())
                .with_attr("date", format_ut_datetime(comment.date()));
            if let Some(author) = comment.author() {
                node = node.with_attr("author", author);
            }
            if let Some(transaction_id) = comment.transaction_id() {
                node = node.with_attr("transaction", transaction_id);
            }
            element.children.push(node.with_text(comment.text()));
        }
        root.children.push(element);
    }
    render_document(&root)
}

fn summary_element(index: usize, summary: &MsbSummary) -> XmlElement {
    let mut element = XmlElement::new("SpMSBSummary")
        .with_attr("id", index.to_string())
        .with_attr("projectid", summary.project_id.clone())
        .with_attr("checksum", summary.checksum.clone())
        .with_attr("remaining", summary.remaining.to_string());
    element.push_text_child("title", Some(&summary.title));
    element.push_text_child("priority", summary.priority);
    element.push_text_child("timeest", summary.estimated_duration);
    element.push_text_child("instrument", joined(&summary.instruments));
    element.push_text_child("target", joined(&summary.targets));
    element.push_text_child("waveband", joined(&summary.wavebands));
    element.push_text_child("orgroup", summary.or_group.as_ref());
    element.push_text_child("suspended", summary.suspended.as_ref());
    if summary.removed {
        element.push_text_child("removed", Some("true"));
    }
    for (name, range) in [
        ("tau", &summary.tau),
        ("seeing", &summary.seeing),
        ("elevation", &summary.elevation),
    ] {
        if !range.is_open() {
            element.children.push(range_element(name, range));
        }
    }
    if summary.relevance != 0.0 {
        element.push_text_child("relevance", Some(format!("{:.4}", summary.relevance)));
    }
    element
}

fn push_snapshot(element: &mut XmlElement, snapshot: &MsbSnapshot) {
    element.push_text_child("title", snapshot.title.as_ref());
    element.push_text_child("target", snapshot.target.as_ref());
    element.push_text_child("instrument", snapshot.instrument.as_ref());
    element.push_text_child("waveband", snapshot.waveband.as_ref());
}

fn range_element(name: &str, range: &Range) -> XmlElement {
    let mut element = XmlElement::new(name);
    element.push_text_child("min", range.min);
    element.push_text_child("max", range.max);
    element
}

fn joined(values: &[String]) -> Option<String> {
    Some(values.join("/")).filter(|value| !value.is_empty())
}
