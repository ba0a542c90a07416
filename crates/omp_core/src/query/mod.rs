//! MSB query documents.
//!
//! # Responsibility
//! - Parse an `<MSBQuery>` document into a predicate tree.
//! - Render the tree as a backend-neutral [`Expr`], plus the feasibility and
//!   deferred constraints a store cannot express as plain predicates.
//!
//! # Invariants
//! - Repeated value elements at one level form a value list (OR).
//! - Repeated range elements at one level are intersected; a conflict makes
//!   the query malformed.
//! - A repeated `min`/`max` inside one range keeps the last value and
//!   records a warning.
//! - Unknown elements are malformed; nothing is silently ignored.
//!
//! # See also
//! - [`crate::repo::msb_repo`] for the SQLite translation.

pub mod expr;

use crate::clock::ut_day_bounds;
use crate::model::range::{airmass_to_elevation, Range, RangeConflict};
use crate::xml::{parse_document, XmlElement, XmlError};
use expr::{CmpOp, Expr, Field};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type QueryResult<T> = Result<T, QueryError>;

const ROOT_ELEMENT: &str = "msbquery";

/// Malformed query document.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    Xml(XmlError),
    UnexpectedRoot(String),
    UnknownElement(String),
    InvalidValue { element: String, value: String },
    /// Element only allowed directly below the root.
    Misplaced(String),
    EmptyGroup(String),
    RangeConflict {
        element: String,
        source: RangeConflict,
    },
    /// A query over history needs at least one bounding criterion.
    Unbounded(&'static str),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xml(err) => write!(f, "{err}"),
            Self::UnexpectedRoot(name) => write!(f, "expected `MSBQuery` root, found `{name}`"),
            Self::UnknownElement(name) => write!(f, "unknown query element `{name}`"),
            Self::InvalidValue { element, value } => {
                write!(f, "invalid value `{value}` for query element `{element}`")
            }
            Self::Misplaced(name) => {
                write!(f, "query element `{name}` is only allowed at the top level")
            }
            Self::EmptyGroup(name) => write!(f, "query group `{name}` has no children"),
            Self::RangeConflict { element, source } => {
                write!(f, "conflicting `{element}` constraints: {source}")
            }
            Self::Unbounded(operation) => write!(
                f,
                "{operation} requires a date, the current date or a project id"
            ),
        }
    }
}

impl Error for QueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Xml(err) => Some(err),
            Self::RangeConflict { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<XmlError> for QueryError {
    fn from(value: XmlError) -> Self {
        Self::Xml(value)
    }
}

/// Result cap requested by a caller's `maxCount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxResults {
    /// `maxCount == 0`: use the configured default.
    Default,
    /// `maxCount < 0`: no limit.
    Unlimited,
    /// `maxCount > 0`: hard cap.
    Limit(usize),
}

impl MaxResults {
    pub fn from_count(count: i64) -> Self {
        match count {
            0 => Self::Default,
            n if n < 0 => Self::Unlimited,
            n => Self::Limit(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }

    /// Resolves to a concrete cap; `None` means unlimited.
    pub fn resolve(self, default: usize) -> Option<usize> {
        match self {
            Self::Default => Some(default),
            Self::Unlimited => None,
            Self::Limit(limit) => Some(limit),
        }
    }
}

/// Node of the parsed predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals any of the values.
    Values { field: Field, values: Vec<String> },
    Between { field: Field, range: Range },
    Text { text: String, boolean: bool },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Negation of the conjunction of its children.
    Not(Vec<Predicate>),
}

impl Predicate {
    pub fn to_expr(&self) -> Expr {
        match self {
            Self::Values { field, values } => Expr::or(
                values
                    .iter()
                    .map(|value| Expr::Eq {
                        field: *field,
                        value: value.clone(),
                    })
                    .collect(),
            ),
            Self::Between { field, range } => Expr::in_range(*field, range),
            Self::Text { text, boolean } => Expr::Match {
                text: text.clone(),
                boolean: *boolean,
            },
            Self::And(items) => Expr::and(items.iter().map(Predicate::to_expr).collect()),
            Self::Or(items) => Expr::or(items.iter().map(Predicate::to_expr).collect()),
            Self::Not(items) => {
                Expr::negate(Expr::and(items.iter().map(Predicate::to_expr).collect()))
            }
        }
    }
}

/// Parsed `<MSBQuery>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsbQuery {
    /// Top-level predicates, implicitly AND'ed.
    pub predicates: Vec<Predicate>,
    /// Current opacity; the MSB's tau constraint must admit it.
    pub tau: Option<Range>,
    /// Current seeing; the MSB's seeing constraint must admit it.
    pub seeing: Option<Range>,
    /// Elevation window (airmass is folded in). Evaluated by the caller.
    pub elevation: Option<Range>,
    /// Reference UT date for the caller's ephemeris checks.
    pub date: Option<String>,
    /// Include exhausted and removed MSBs.
    pub disable_remaining: bool,
    /// Include MSBs of disabled projects.
    pub disable_state: bool,
    /// Ambiguous input that was accepted.
    pub warnings: Vec<String>,
}

impl MsbQuery {
    /// Parses a query document.
    ///
    /// # Errors
    /// Any [`QueryError`] variant; all of them map to a malformed query.
    pub fn parse(xml: &str) -> QueryResult<Self> {
        let root = parse_document(xml)?;
        Self::from_element(&root)
    }

    pub fn from_element(root: &XmlElement) -> QueryResult<Self> {
        if !root.name.eq_ignore_ascii_case(ROOT_ELEMENT) {
            return Err(QueryError::UnexpectedRoot(root.name.clone()));
        }

        let mut query = MsbQuery::default();
        let mut top_level = Vec::new();
        for child in &root.children {
            let name = child.name.to_ascii_lowercase();
            match name.as_str() {
                "tau" => merge_range(&mut query.tau, &name, child, &mut query.warnings)?,
                "seeing" => merge_range(&mut query.seeing, &name, child, &mut query.warnings)?,
                "elevation" => {
                    merge_range(&mut query.elevation, &name, child, &mut query.warnings)?
                }
                "airmass" => {
                    let airmass = parse_range(&name, child, &mut query.warnings)?;
                    intersect_into(
                        &mut query.elevation,
                        "elevation",
                        airmass_to_elevation(&airmass),
                    )?;
                }
                "date" => {
                    let value = child.trimmed_text();
                    if ut_day_bounds(value).is_none() {
                        return Err(invalid_value(&name, value));
                    }
                    if query.date.is_some() {
                        query.warnings.push("repeated `date`; using last value".to_string());
                    }
                    query.date = Some(value.to_string());
                }
                "disableconstraint" => match child.trimmed_text().to_ascii_lowercase().as_str() {
                    "remaining" => query.disable_remaining = true,
                    "state" => query.disable_state = true,
                    other => return Err(invalid_value(&name, other)),
                },
                _ => top_level.push(child),
            }
        }

        query.predicates = parse_level(&top_level, &mut query.warnings)?;
        for warning in &query.warnings {
            log::warn!("event=query_parse module=query status=warn detail={warning:?}");
        }
        Ok(query)
    }

    /// Renders the predicates plus the default lifecycle filters.
    pub fn to_expr(&self) -> Expr {
        let mut clauses: Vec<Expr> = self.predicates.iter().map(Predicate::to_expr).collect();
        if !self.disable_remaining {
            clauses.push(Expr::Cmp {
                field: Field::Remaining,
                op: CmpOp::Gt,
                value: 0.0,
            });
            clauses.push(Expr::Flag {
                field: Field::Removed,
                value: false,
            });
        }
        if !self.disable_state {
            clauses.push(Expr::Flag {
                field: Field::ProjectEnabled,
                value: true,
            });
        }
        Expr::and(clauses)
    }

    /// Whether an MSB with these site-quality constraints is observable in
    /// the queried conditions.
    pub fn is_feasible(&self, msb_tau: &Range, msb_seeing: &Range) -> bool {
        let admits = |constraint: &Range, current: &Option<Range>| {
            current
                .as_ref()
                .map_or(true, |current| constraint.overlaps(current))
        };
        admits(msb_tau, &self.tau) && admits(msb_seeing, &self.seeing)
    }

    pub fn has_text(&self) -> bool {
        !self.to_expr().relevance_terms().is_empty()
    }
}

fn parse_level(
    children: &[&XmlElement],
    warnings: &mut Vec<String>,
) -> QueryResult<Vec<Predicate>> {
    let mut out: Vec<Predicate> = Vec::new();
    let mut texts: Vec<Predicate> = Vec::new();

    for child in children {
        let name = child.name.to_ascii_lowercase();
        if let Some(field) = Field::from_value_element(&name) {
            let value = child.trimmed_text();
            if value.is_empty() {
                return Err(invalid_value(&name, value));
            }
            push_value(&mut out, field, value);
        } else if let Some(field) = Field::from_range_element(&name) {
            let range = parse_range(&name, child, warnings)?;
            push_range(&mut out, field, range)?;
        } else {
            match name.as_str() {
                "text" => {
                    let text = child.trimmed_text();
                    if text.is_empty() {
                        return Err(invalid_value(&name, text));
                    }
                    texts.push(Predicate::Text {
                        text: text.to_string(),
                        boolean: matches!(child.attr("boolean"), Some("1" | "true" | "yes")),
                    });
                }
                "or" | "not" => {
                    let nested: Vec<&XmlElement> = child.children.iter().collect();
                    if nested.is_empty() {
                        return Err(QueryError::EmptyGroup(name));
                    }
                    let items = parse_level(&nested, warnings)?;
                    out.push(if name == "or" {
                        Predicate::Or(items)
                    } else {
                        Predicate::Not(items)
                    });
                }
                "tau" | "seeing" | "elevation" | "airmass" | "date" | "disableconstraint" => {
                    return Err(QueryError::Misplaced(name));
                }
                _ => return Err(QueryError::UnknownElement(child.name.clone())),
            }
        }
    }

    match texts.len() {
        0 => {}
        1 => out.extend(texts),
        _ => out.push(Predicate::Or(texts)),
    }
    Ok(out)
}

fn push_value(out: &mut Vec<Predicate>, field: Field, value: &str) {
    for predicate in out.iter_mut() {
        if let Predicate::Values {
            field: existing,
            values,
        } = predicate
        {
            if *existing == field {
                values.push(value.to_string());
                return;
            }
        }
    }
    out.push(Predicate::Values {
        field,
        values: vec![value.to_string()],
    });
}

fn push_range(out: &mut Vec<Predicate>, field: Field, range: Range) -> QueryResult<()> {
    for predicate in out.iter_mut() {
        if let Predicate::Between {
            field: existing,
            range: current,
        } = predicate
        {
            if *existing == field {
                return current
                    .intersect_with(&range)
                    .map_err(|source| QueryError::RangeConflict {
                        element: field.as_str().to_string(),
                        source,
                    });
            }
        }
    }
    out.push(Predicate::Between { field, range });
    Ok(())
}

fn merge_range(
    slot: &mut Option<Range>,
    name: &str,
    element: &XmlElement,
    warnings: &mut Vec<String>,
) -> QueryResult<()> {
    let range = parse_range(name, element, warnings)?;
    intersect_into(slot, name, range)
}

fn intersect_into(slot: &mut Option<Range>, name: &str, range: Range) -> QueryResult<()> {
    match slot {
        Some(current) => current
            .intersect_with(&range)
            .map_err(|source| QueryError::RangeConflict {
                element: name.to_string(),
                source,
            }),
        None => {
            *slot = Some(range);
            Ok(())
        }
    }
}

/// Parses `<x><min>a</min><max>b</max></x>` or a point value `<x>a</x>`.
fn parse_range(name: &str, element: &XmlElement, warnings: &mut Vec<String>) -> QueryResult<Range> {
    if element.children.is_empty() {
        let value = parse_number(name, element.trimmed_text())?;
        return Ok(Range::bounded(value, value));
    }

    let mut range = Range::open();
    for bound in &element.children {
        let bound_name = bound.name.to_ascii_lowercase();
        let slot = match bound_name.as_str() {
            "min" => &mut range.min,
            "max" => &mut range.max,
            _ => return Err(QueryError::UnknownElement(format!("{name}/{}", bound.name))),
        };
        if slot.is_some() {
            warnings.push(format!("repeated `{bound_name}` in `{name}`; using last value"));
        }
        *slot = Some(parse_number(
            &format!("{name}/{bound_name}"),
            bound.trimmed_text(),
        )?);
    }
    Ok(range)
}

fn parse_number(element: &str, raw: &str) -> QueryResult<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| invalid_value(element, raw))
}

fn invalid_value(element: &str, value: &str) -> QueryError {
    QueryError::InvalidValue {
        element: element.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::expr::Field;
    use super::{MaxResults, MsbQuery, Predicate, QueryError};
    use crate::model::range::Range;

    #[test]
    fn max_results_follow_count_convention() {
        assert_eq!(MaxResults::from_count(0).resolve(100), Some(100));
        assert_eq!(MaxResults::from_count(-1).resolve(100), None);
        assert_eq!(MaxResults::from_count(5).resolve(100), Some(5));
    }

    #[test]
    fn repeated_values_form_value_list() {
        let query = MsbQuery::parse(
            "<MSBQuery><instrument>SCUBA</instrument><projectid>M01BU53</projectid>\
             <instrument>RXA3</instrument></MSBQuery>",
        )
        .unwrap();
        assert_eq!(
            query.predicates,
            vec![
                Predicate::Values {
                    field: Field::Instrument,
                    values: vec!["SCUBA".to_string(), "RXA3".to_string()],
                },
                Predicate::Values {
                    field: Field::ProjectId,
                    values: vec!["M01BU53".to_string()],
                },
            ]
        );
    }

    #[test]
    fn repeated_ranges_are_intersected() {
        let query = MsbQuery::parse(
            "<MSBQuery><priority><min>1</min></priority><priority><max>4</max></priority>\
             <tau>0.05</tau><tau><min>0</min><max>0.1</max></tau></MSBQuery>",
        )
        .unwrap();
        assert_eq!(
            query.predicates,
            vec![Predicate::Between {
                field: Field::Priority,
                range: Range::bounded(1.0, 4.0),
            }]
        );
        assert_eq!(query.tau, Some(Range::bounded(0.05, 0.05)));
    }

    #[test]
    fn conflicting_ranges_are_malformed() {
        let err = MsbQuery::parse(
            "<MSBQuery><priority><max>1</max></priority><priority><min>3</min></priority></MSBQuery>",
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::RangeConflict { .. }));
    }

    #[test]
    fn repeated_bound_keeps_last_value_with_warning() {
        let query = MsbQuery::parse(
            "<MSBQuery><seeing><max>1.0</max><max>2.0</max></seeing></MSBQuery>",
        )
        .unwrap();
        assert_eq!(query.seeing, Some(Range::at_most(2.0)));
        assert_eq!(query.warnings.len(), 1);
        assert!(query.warnings[0].contains("repeated `max`"));
    }

    #[test]
    fn unknown_and_misplaced_elements_are_malformed() {
        assert!(matches!(
            MsbQuery::parse("<MSBQuery><colour>red</colour></MSBQuery>"),
            Err(QueryError::UnknownElement(_))
        ));
        assert!(matches!(
            MsbQuery::parse("<MSBQuery><or><tau>0.1</tau></or></MSBQuery>"),
            Err(QueryError::Misplaced(_))
        ));
        assert!(matches!(
            MsbQuery::parse("<Query/>"),
            Err(QueryError::UnexpectedRoot(_))
        ));
        assert!(matches!(
            MsbQuery::parse("<MSBQuery><date>tomorrow</date></MSBQuery>"),
            Err(QueryError::InvalidValue { .. })
        ));
    }

    #[test]
    fn composites_and_defaults_render_to_expr() {
        let query = MsbQuery::parse(
            "<MSBQuery><or><instrument>SCUBA</instrument><target>Mars</target></or>\
             <not><text>calibration</text></not>\
             <disableconstraint>state</disableconstraint></MSBQuery>",
        )
        .unwrap();
        assert!(query.disable_state);
        assert!(!query.has_text());
        assert_eq!(
            query.to_expr().to_string(),
            "((instrument = \"SCUBA\" OR target = \"Mars\") AND NOT (MATCH(\"calibration\")) \
             AND remaining > 0 AND removed IS false)"
        );
    }

    #[test]
    fn text_boolean_flag_and_deferred_constraints() {
        let query = MsbQuery::parse(
            "<MSBQuery><text boolean=\"1\">mars OR jupiter</text>\
             <airmass><max>2</max></airmass><date>2002-03-10</date></MSBQuery>",
        )
        .unwrap();
        assert!(query.has_text());
        assert_eq!(
            query.predicates,
            vec![Predicate::Text {
                text: "mars OR jupiter".to_string(),
                boolean: true,
            }]
        );
        let elevation = query.elevation.unwrap();
        assert!((elevation.min.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(elevation.max, None);
        assert_eq!(query.date.as_deref(), Some("2002-03-10"));
    }

    #[test]
    fn feasibility_checks_stored_constraints() {
        let query = MsbQuery::parse("<MSBQuery><tau>0.06</tau></MSBQuery>").unwrap();
        assert!(query.is_feasible(&Range::bounded(0.0, 0.08), &Range::open()));
        assert!(!query.is_feasible(&Range::bounded(0.0, 0.05), &Range::open()));
        assert!(query.is_feasible(&Range::open(), &Range::bounded(0.0, 0.1)));
        assert!(MsbQuery::default().is_feasible(&Range::bounded(0.0, 0.01), &Range::open()));
    }
}
