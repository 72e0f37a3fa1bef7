//! Attribute expressions and deferred references.
//!
//! Strings in the document may embed `${...}` expressions:
//!
//! - `${var.NAME}` is substituted while the graph is built.
//! - `${KIND.NAME.ATTR[.PATH...]}` becomes a [`Reference`] to another node.
//!   Its value is only known once that node has been applied.
//!
//! A string made of a single expression keeps the JSON type of the value it
//! resolves to; anything else is an interpolation and produces a string.
//! `$${` escapes a literal `${`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::VariableValues;
use crate::error::GraphError;
use crate::resource::{Attributes, ResourceId, ResourceKind};

/// A reference to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Resource the value comes from.
    pub target: ResourceId,
    /// Top-level attribute name.
    pub attribute: String,
    /// Nested path inside the attribute (object keys or list indices).
    pub path: Vec<String>,
}

/// A piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Literal text.
    Text(String),
    /// Deferred reference, rendered as a string once resolved.
    Ref(Reference),
}

/// A desired attribute value, possibly depending on other resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Fully known value.
    Literal(Value),
    /// Whole-value reference; keeps the referenced JSON type.
    Reference(Reference),
    /// String built from text and references.
    Interpolation(Vec<Fragment>),
    /// List containing at least one deferred element.
    List(Vec<Expr>),
    /// Object containing at least one deferred member.
    Map(BTreeMap<String, Expr>),
}

/// Context used while parsing expressions.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// Where the expression lives, for error messages.
    pub from: &'a str,
    /// Resolved input variables.
    pub variables: &'a VariableValues,
}

impl Reference {
    /// Extracts the referenced value from the target's attributes.
    #[must_use]
    pub fn extract(&self, attributes: &Attributes) -> Option<Value> {
        let mut current = attributes.get(&self.attribute)?;

        for segment in &self.path {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current.clone())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}", self.target, self.attribute)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        write!(f, "}}")
    }
}

impl Expr {
    /// Parses a document value into an expression.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed expressions and unknown variables.
    pub fn parse(value: &Value, ctx: ParseContext<'_>) -> Result<Self, GraphError> {
        let expr = match value {
            Value::String(s) => parse_string(s, ctx)?,
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| Self::parse(item, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::List(items)
            }
            Value::Object(map) => {
                let members = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Self::parse(v, ctx)?)))
                    .collect::<Result<BTreeMap<_, _>, GraphError>>()?;
                Self::Map(members)
            }
            other => Self::Literal(other.clone()),
        };

        Ok(expr.collapse())
    }

    /// Folds containers whose members are all literal back into a literal.
    fn collapse(self) -> Self {
        match self {
            Self::List(items) if items.iter().all(Self::is_literal) => Self::Literal(Value::Array(
                items.into_iter().filter_map(Self::into_literal).collect(),
            )),
            Self::Map(members) if members.values().all(Self::is_literal) => {
                Self::Literal(Value::Object(
                    members
                        .into_iter()
                        .filter_map(|(k, v)| v.into_literal().map(|v| (k, v)))
                        .collect(),
                ))
            }
            other => other,
        }
    }

    /// Returns true if the expression has no deferred parts.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    fn into_literal(self) -> Option<Value> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Collects every reference in the expression.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Interpolation(fragments) => out.extend(fragments.iter().filter_map(|f| match f {
                Fragment::Ref(r) => Some(r),
                Fragment::Text(_) => None,
            })),
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(members) => members.values().for_each(|m| m.collect_references(out)),
        }
    }

    /// Resolves the expression with a lookup for referenced values.
    ///
    /// # Errors
    ///
    /// Returns the first reference the lookup could not satisfy.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, Reference>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::Interpolation(fragments) => {
                let mut out = String::new();
                for fragment in fragments {
                    match fragment {
                        Fragment::Text(text) => out.push_str(text),
                        Fragment::Ref(r) => {
                            let value = lookup(r).ok_or_else(|| r.clone())?;
                            out.push_str(&render(&value));
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(members) => members
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
                .collect::<Result<serde_json::Map<_, _>, Reference>>()
                .map(Value::Object),
        }
    }

    /// Resolves against a map of known attributes per resource.
    ///
    /// # Errors
    ///
    /// Returns the first reference whose value is not known.
    pub fn resolve_from(&self, known: &BTreeMap<ResourceId, Attributes>) -> Result<Value, Reference> {
        self.resolve(&|r: &Reference| known.get(&r.target).and_then(|attrs| r.extract(attrs)))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Reference(r) => write!(f, "\"{r}\""),
            Self::Interpolation(fragments) => {
                f.write_str("\"")?;
                for fragment in fragments {
                    match fragment {
                        Fragment::Text(text) => f.write_str(text)?,
                        Fragment::Ref(r) => write!(f, "{r}")?,
                    }
                }
                f.write_str("\"")
            }
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(members) => {
                f.write_str("{")?;
                for (i, (k, v)) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Renders a resolved value inside an interpolated string.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A parsed `${...}` body.
enum Substitution {
    Value(Value),
    Ref(Reference),
}

fn parse_string(s: &str, ctx: ParseContext<'_>) -> Result<Expr, GraphError> {
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut whole: Option<Substitution> = None;
    let mut text = String::new();
    let mut rest = s;
    let mut pieces = 0usize;

    while let Some(start) = rest.find('$') {
        text.push_str(&rest[..start]);
        let after = &rest[start..];

        if let Some(stripped) = after.strip_prefix("$${") {
            text.push_str("${");
            rest = stripped;
            continue;
        }

        let Some(body_and_rest) = after.strip_prefix("${") else {
            text.push('$');
            rest = &after[1..];
            continue;
        };

        let end = body_and_rest.find('}').ok_or_else(|| GraphError::InvalidExpression {
            from: ctx.from.to_string(),
            expression: s.to_string(),
            reason: String::from("unterminated ${"),
        })?;

        let substitution = parse_body(body_and_rest[..end].trim(), s, ctx)?;
        rest = &body_and_rest[end + 1..];

        if !text.is_empty() {
            fragments.push(Fragment::Text(std::mem::take(&mut text)));
            pieces += 1;
        }
        pieces += 1;

        match substitution {
            Substitution::Value(value) => {
                fragments.push(Fragment::Text(render(&value)));
                whole = Some(Substitution::Value(value));
            }
            Substitution::Ref(r) => {
                fragments.push(Fragment::Ref(r.clone()));
                whole = Some(Substitution::Ref(r));
            }
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        fragments.push(Fragment::Text(text));
        pieces += 1;
    }

    if pieces == 1
        && let Some(single) = whole
    {
        return Ok(match single {
            Substitution::Value(value) => Expr::Literal(value),
            Substitution::Ref(r) => Expr::Reference(r),
        });
    }

    if fragments.iter().all(|f| matches!(f, Fragment::Text(_))) {
        let joined: String = fragments
            .into_iter()
            .filter_map(|f| match f {
                Fragment::Text(t) => Some(t),
                Fragment::Ref(_) => None,
            })
            .collect();
        return Ok(Expr::Literal(Value::String(joined)));
    }

    Ok(Expr::Interpolation(merge_text(fragments)))
}

/// Joins adjacent text fragments.
fn merge_text(fragments: Vec<Fragment>) -> Vec<Fragment> {
    let mut merged: Vec<Fragment> = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        match (merged.last_mut(), fragment) {
            (Some(Fragment::Text(prev)), Fragment::Text(next)) => prev.push_str(&next),
            (_, fragment) => merged.push(fragment),
        }
    }
    merged
}

fn parse_body(body: &str, expression: &str, ctx: ParseContext<'_>) -> Result<Substitution, GraphError> {
    let invalid = |reason: &str| GraphError::InvalidExpression {
        from: ctx.from.to_string(),
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = body.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid("empty path segment"));
    }

    if segments[0] == "var" {
        if segments.len() != 2 {
            return Err(invalid("variable references take the form var.NAME"));
        }
        return ctx
            .variables
            .get(segments[1])
            .cloned()
            .map(Substitution::Value)
            .ok_or_else(|| GraphError::UnresolvedReference {
                from: ctx.from.to_string(),
                reference: body.to_string(),
            });
    }

    if segments.len() < 3 {
        return Err(invalid("resource references take the form KIND.NAME.ATTRIBUTE"));
    }

    let kind: ResourceKind = segments[0]
        .parse()
        .map_err(|_| GraphError::UnresolvedReference {
            from: ctx.from.to_string(),
            reference: body.to_string(),
        })?;

    Ok(Substitution::Ref(Reference {
        target: ResourceId::new(kind, segments[1]),
        attribute: segments[2].to_string(),
        path: segments[3..].iter().map(ToString::to_string).collect(),
    }))
}
