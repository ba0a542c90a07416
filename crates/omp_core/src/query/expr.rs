//! Backend-neutral boolean expression over MSB attributes.
//!
//! Storage backends translate [`Expr`] into their own query language; the
//! SQLite translation lives in [`crate::repo::msb_repo`].

use crate::model::range::Range;
use std::fmt::{Display, Formatter};

/// Queryable MSB attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    ProjectId,
    Checksum,
    Title,
    Instrument,
    Target,
    Waveband,
    Semester,
    Country,
    Priority,
    TimeEst,
    Remaining,
    Removed,
    ProjectEnabled,
}

impl Field {
    /// Query-document element name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProjectId => "projectid",
            Self::Checksum => "checksum",
            Self::Title => "title",
            Self::Instrument => "instrument",
            Self::Target => "target",
            Self::Waveband => "waveband",
            Self::Semester => "semester",
            Self::Country => "country",
            Self::Priority => "priority",
            Self::TimeEst => "timeest",
            Self::Remaining => "remaining",
            Self::Removed => "removed",
            Self::ProjectEnabled => "enabled",
        }
    }

    /// Fields compared by string equality.
    pub fn from_value_element(name: &str) -> Option<Self> {
        match name {
            "projectid" => Some(Self::ProjectId),
            "checksum" => Some(Self::Checksum),
            "title" => Some(Self::Title),
            "instrument" => Some(Self::Instrument),
            "target" => Some(Self::Target),
            "waveband" => Some(Self::Waveband),
            "semester" => Some(Self::Semester),
            "country" => Some(Self::Country),
            _ => None,
        }
    }

    /// Fields compared numerically.
    pub fn from_range_element(name: &str) -> Option<Self> {
        match name {
            "priority" => Some(Self::Priority),
            "timeest" => Some(Self::TimeEst),
            "remaining" => Some(Self::Remaining),
            _ => None,
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(bool),
    /// Case-insensitive string equality.
    Eq { field: Field, value: String },
    Cmp { field: Field, op: CmpOp, value: f64 },
    Flag { field: Field, value: bool },
    /// Free-text match; `boolean` enables AND/OR/NOT inside `text`.
    Match { text: String, boolean: bool },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Conjunction with constant folding and flattening.
    pub fn and(items: Vec<Expr>) -> Expr {
        let mut out = Vec::new();
        for item in items {
            match item {
                Expr::Const(true) => {}
                Expr::Const(false) => return Expr::Const(false),
                Expr::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Expr::Const(true),
            1 => out.remove(0),
            _ => Expr::And(out),
        }
    }

    /// Disjunction with constant folding and flattening.
    pub fn or(items: Vec<Expr>) -> Expr {
        let mut out = Vec::new();
        for item in items {
            match item {
                Expr::Const(false) => {}
                Expr::Const(true) => return Expr::Const(true),
                Expr::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Expr::Const(false),
            1 => out.remove(0),
            _ => Expr::Or(out),
        }
    }

    pub fn negate(item: Expr) -> Expr {
        match item {
            Expr::Const(value) => Expr::Const(!value),
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }

    /// Membership test for a numeric field, honouring inverted ranges.
    pub fn in_range(field: Field, range: &Range) -> Expr {
        let lower = range.min.map(|value| Expr::Cmp {
            field,
            op: CmpOp::Ge,
            value,
        });
        let upper = range.max.map(|value| Expr::Cmp {
            field,
            op: CmpOp::Le,
            value,
        });
        let bounds: Vec<Expr> = lower.into_iter().chain(upper).collect();
        if range.is_inverted() {
            Expr::or(bounds)
        } else {
            Expr::and(bounds)
        }
    }

    /// Collects free-text terms that contribute to relevance, i.e. those
    /// not under a negation.
    pub fn relevance_terms(&self) -> Vec<(&str, bool)> {
        let mut out = Vec::new();
        self.collect_terms(&mut out);
        out
    }

    fn collect_terms<'a>(&'a self, out: &mut Vec<(&'a str, bool)>) {
        match self {
            Expr::Match { text, boolean } => out.push((text.as_str(), *boolean)),
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.collect_terms(out);
                }
            }
            _ => {}
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(value) => write!(f, "{}", if *value { "TRUE" } else { "FALSE" }),
            Expr::Eq { field, value } => write!(f, "{field} = {value:?}"),
            Expr::Cmp { field, op, value } => write!(f, "{field} {} {value}", op.as_str()),
            Expr::Flag { field, value } => write!(f, "{field} IS {value}"),
            Expr::Match { text, boolean } => {
                write!(f, "MATCH{}({text:?})", if *boolean { "_BOOL" } else { "" })
            }
            Expr::And(items) => write_joined(f, items, " AND "),
            Expr::Or(items) => write_joined(f, items, " OR "),
            Expr::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut Formatter<'_>, items: &[Expr], separator: &str) -> std::fmt::Result {
    f.write_str("(")?;
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(")")
}
