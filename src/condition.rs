//! Condition expressions used by IF blocks and conditional node selection.
//!
//! ```text
//! simple  := operand op operand          op: = != < <= > >=
//! operand := @attribute | 'literal' | number | column-or-path
//! complex := (condition) and|or (condition) ...
//! ```
//!
//! One nesting level uses a single logical operator; mixing `and` and `or`
//! needs explicit grouping.

use std::cmp::Ordering;

use thiserror::Error;

use crate::document::Element;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("Condition is empty")]
    Empty,
    #[error("Comparison operator missing in '{0}'")]
    MissingOperator(String),
    #[error("Unbalanced brackets in '{0}'")]
    UnbalancedBrackets(String),
    #[error("Logical operator expected between groups in '{0}'")]
    MissingLogicalOperator(String),
    #[error("'and' and 'or' mixed without grouping in '{0}'")]
    MixedLogicalOperators(String),
    #[error("Operand missing in '{0}'")]
    EmptyOperand(String),
    #[error("Unterminated literal in '{0}'")]
    UnterminatedLiteral(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::NotEq => "!=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// `@name`, read from the node under test.
    Attribute(String),
    Literal(String),
    /// A column name or tree path. `mapping` is filled in once the mapping
    /// defining that column or path is known.
    Reference { name: String, mapping: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Simple {
        left: Operand,
        operator: ComparisonOperator,
        right: Operand,
    },
    Complex {
        left: Box<Condition>,
        operator: LogicalOperator,
        right: Box<Condition>,
    },
}

/// Supplies operand values while a condition is evaluated.
pub trait OperandSource {
    fn attribute(&self, _name: &str) -> Option<String> {
        None
    }

    fn reference(&self, name: &str, mapping: Option<usize>) -> Option<String>;
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ConditionError::Empty);
        }
        if trimmed.starts_with('(') {
            return parse_groups(trimmed);
        }
        parse_simple(trimmed)
    }

    pub fn evaluate(&self, source: &dyn OperandSource) -> bool {
        match self {
            Condition::Simple {
                left,
                operator,
                right,
            } => compare(*operator, &resolve(left, source), &resolve(right, source)),
            Condition::Complex {
                left,
                operator: LogicalOperator::And,
                right,
            } => left.evaluate(source) && right.evaluate(source),
            Condition::Complex {
                left,
                operator: LogicalOperator::Or,
                right,
            } => left.evaluate(source) || right.evaluate(source),
        }
    }

    /// Attribute values a newly created node must carry so it matches this
    /// condition: the `@attr = value` comparisons of the top-level AND chain
    /// (the left branch of an OR).
    pub fn attribute_assignments(&self, source: &dyn OperandSource) -> Vec<(String, String)> {
        let mut assignments = Vec::new();
        self.collect_assignments(source, &mut assignments);
        assignments
    }

    fn collect_assignments(&self, source: &dyn OperandSource, out: &mut Vec<(String, String)>) {
        match self {
            Condition::Simple {
                left,
                operator: ComparisonOperator::Eq,
                right,
            } => match (left, right) {
                (Operand::Attribute(name), Operand::Attribute(_)) => {
                    out.push((name.clone(), resolve(right, source)))
                }
                (Operand::Attribute(name), other) | (other, Operand::Attribute(name)) => {
                    out.push((name.clone(), resolve(other, source)))
                }
                _ => {}
            },
            Condition::Simple { .. } => {}
            Condition::Complex {
                left,
                operator: LogicalOperator::And,
                right,
            } => {
                left.collect_assignments(source, out);
                right.collect_assignments(source, out);
            }
            Condition::Complex { left, .. } => left.collect_assignments(source, out),
        }
    }

    /// Visits every reference operand, e.g. to bind it to a mapping.
    pub fn for_each_reference_mut(&mut self, visit: &mut dyn FnMut(&str, &mut Option<usize>)) {
        match self {
            Condition::Simple { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Reference { name, mapping } = operand {
                        visit(name, mapping);
                    }
                }
            }
            Condition::Complex { left, right, .. } => {
                left.for_each_reference_mut(visit);
                right.for_each_reference_mut(visit);
            }
        }
    }

    pub fn references(&self) -> Vec<&str> {
        match self {
            Condition::Simple { left, right, .. } => [left, right]
                .into_iter()
                .filter_map(|operand| match operand {
                    Operand::Reference { name, .. } => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            Condition::Complex { left, right, .. } => {
                let mut names = left.references();
                names.extend(right.references());
                names
            }
        }
    }
}

/// Attribute operands read from a candidate element; references are passed
/// through to `inner`.
pub struct ElementOperands<'a> {
    pub element: &'a Element,
    pub inner: &'a dyn OperandSource,
}

impl OperandSource for ElementOperands<'_> {
    fn attribute(&self, name: &str) -> Option<String> {
        self.element.attribute(name).map(str::to_string)
    }

    fn reference(&self, name: &str, mapping: Option<usize>) -> Option<String> {
        self.inner.reference(name, mapping)
    }
}

fn resolve(operand: &Operand, source: &dyn OperandSource) -> String {
    match operand {
        Operand::Attribute(name) => source.attribute(name).unwrap_or_default(),
        Operand::Literal(text) => text.clone(),
        Operand::Reference { name, mapping } => source.reference(name, *mapping).unwrap_or_default(),
    }
}

/// Every operator compares the operands as text, so `'9' > '10'`.
fn compare(operator: ComparisonOperator, left: &str, right: &str) -> bool {
    let ordering = left.cmp(right);
    match operator {
        ComparisonOperator::Eq => left == right,
        ComparisonOperator::NotEq => left != right,
        ComparisonOperator::Lt => ordering == Ordering::Less,
        ComparisonOperator::Le => ordering != Ordering::Greater,
        ComparisonOperator::Gt => ordering == Ordering::Greater,
        ComparisonOperator::Ge => ordering != Ordering::Less,
    }
}

fn parse_groups(text: &str) -> Result<Condition, ConditionError> {
    let chars = text.char_indices().collect::<Vec<_>>();
    let mut groups = Vec::new();
    let mut operators = Vec::new();
    let mut idx = 0;
    loop {
        while idx < chars.len() && chars[idx].1.is_whitespace() {
            idx += 1;
        }
        if idx >= chars.len() {
            break;
        }
        if chars[idx].1 != '(' {
            return Err(ConditionError::MissingLogicalOperator(text.to_string()));
        }
        let close = matching_bracket(&chars, idx)
            .ok_or_else(|| ConditionError::UnbalancedBrackets(text.to_string()))?;
        let inner = &text[chars[idx].0 + 1..chars[close].0];
        groups.push(Condition::parse(inner)?);
        idx = close + 1;

        while idx < chars.len() && chars[idx].1.is_whitespace() {
            idx += 1;
        }
        if idx >= chars.len() {
            break;
        }
        let word_start = idx;
        while idx < chars.len() && chars[idx].1.is_ascii_alphabetic() {
            idx += 1;
        }
        let word_end = chars.get(idx).map(|(pos, _)| *pos).unwrap_or(text.len());
        let word = text[chars[word_start].0..word_end].to_ascii_lowercase();
        let operator = match word.as_str() {
            "and" => LogicalOperator::And,
            "or" => LogicalOperator::Or,
            "" if chars[word_start].1 == ')' => {
                return Err(ConditionError::UnbalancedBrackets(text.to_string()));
            }
            "" => return Err(ConditionError::MissingOperator(text.to_string())),
            _ => return Err(ConditionError::MissingLogicalOperator(text.to_string())),
        };
        if operators.first().is_some_and(|first| *first != operator) {
            return Err(ConditionError::MixedLogicalOperators(text.to_string()));
        }
        operators.push(operator);
    }
    if groups.len() != operators.len() + 1 {
        return Err(ConditionError::EmptyOperand(text.to_string()));
    }
    let mut groups = groups.into_iter();
    let mut condition = groups
        .next()
        .ok_or_else(|| ConditionError::EmptyOperand(text.to_string()))?;
    for (operator, right) in operators.into_iter().zip(groups) {
        condition = Condition::Complex {
            left: Box::new(condition),
            operator,
            right: Box::new(right),
        };
    }
    Ok(condition)
}

fn matching_bracket(chars: &[(usize, char)], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (idx, (_, c)) in chars.iter().enumerate().skip(open) {
        match (quote, *c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(*c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_simple(text: &str) -> Result<Condition, ConditionError> {
    let (position, operator, width) = find_operator(text)?
        .ok_or_else(|| ConditionError::MissingOperator(text.to_string()))?;
    let left = parse_operand(&text[..position], text)?;
    let right_text = &text[position + width..];
    if find_operator(right_text)?.is_some() || has_logical_word(right_text) {
        return Err(ConditionError::MixedLogicalOperators(text.to_string()));
    }
    let right = parse_operand(right_text, text)?;
    Ok(Condition::Simple {
        left,
        operator,
        right,
    })
}

/// First comparison operator outside quotes, as (byte offset, operator, width).
fn find_operator(text: &str) -> Result<Option<(usize, ComparisonOperator, usize)>, ConditionError> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut idx = 0;
    while idx < bytes.len() {
        let b = bytes[idx];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'!' if bytes.get(idx + 1) == Some(&b'=') => {
                    return Ok(Some((idx, ComparisonOperator::NotEq, 2)));
                }
                b'<' | b'>' => {
                    let with_eq = bytes.get(idx + 1) == Some(&b'=');
                    let operator = match (b, with_eq) {
                        (b'<', true) => ComparisonOperator::Le,
                        (b'<', false) => ComparisonOperator::Lt,
                        (_, true) => ComparisonOperator::Ge,
                        (_, false) => ComparisonOperator::Gt,
                    };
                    return Ok(Some((idx, operator, if with_eq { 2 } else { 1 })));
                }
                b'=' => return Ok(Some((idx, ComparisonOperator::Eq, 1))),
                _ => {}
            },
        }
        idx += 1;
    }
    if quote.is_some() {
        return Err(ConditionError::UnterminatedLiteral(text.to_string()));
    }
    Ok(None)
}

fn has_logical_word(text: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut outside = String::new();
    for c in text.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => outside.push(c),
        }
        if quote.is_some() {
            outside.push(' ');
        }
    }
    outside
        .split_whitespace()
        .any(|word| word.eq_ignore_ascii_case("and") || word.eq_ignore_ascii_case("or"))
}

fn parse_operand(raw: &str, whole: &str) -> Result<Operand, ConditionError> {
    let operand = raw.trim();
    if operand.is_empty() {
        return Err(ConditionError::EmptyOperand(whole.to_string()));
    }
    for quote in ['\'', '"'] {
        if let Some(rest) = operand.strip_prefix(quote) {
            return match rest.strip_suffix(quote) {
                Some(inner) => Ok(Operand::Literal(inner.to_string())),
                None => Err(ConditionError::UnterminatedLiteral(whole.to_string())),
            };
        }
    }
    if let Some(name) = operand.strip_prefix('@') {
        if name.trim().is_empty() {
            return Err(ConditionError::EmptyOperand(whole.to_string()));
        }
        return Ok(Operand::Attribute(name.trim().to_string()));
    }
    if operand.parse::<f64>().is_ok() {
        return Ok(Operand::Literal(operand.to_string()));
    }
    Ok(Operand::Reference {
        name: operand.to_string(),
        mapping: None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Attrs(HashMap<&'static str, &'static str>);

    impl OperandSource for Attrs {
        fn attribute(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }

        fn reference(&self, name: &str, _mapping: Option<usize>) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    fn attrs(pairs: &[(&'static str, &'static str)]) -> Attrs {
        Attrs(pairs.iter().copied().collect())
    }

    #[test]
    fn parse_simple_condition() {
        let condition = Condition::parse("@ccy = 'EUR'").expect("parse");
        assert_eq!(
            condition,
            Condition::Simple {
                left: Operand::Attribute("ccy".into()),
                operator: ComparisonOperator::Eq,
                right: Operand::Literal("EUR".into()),
            }
        );
    }

    #[test]
    fn operators_inside_literals_are_ignored() {
        let condition = Condition::parse("NAME != 'a=b'").expect("parse");
        assert!(condition.evaluate(&attrs(&[("NAME", "x")])));
        assert!(!condition.evaluate(&attrs(&[("NAME", "a=b")])));
    }

    #[test]
    fn and_group_requires_both_sides() {
        let condition = Condition::parse("(@ccy = 'EUR') and (@qty > '0')").expect("parse");
        assert!(condition.evaluate(&attrs(&[("ccy", "EUR"), ("qty", "5")])));
        assert!(!condition.evaluate(&attrs(&[("ccy", "USD"), ("qty", "5")])));
        assert!(!condition.evaluate(&attrs(&[("ccy", "EUR"), ("qty", "0")])));
        assert!(!condition.evaluate(&attrs(&[("ccy", "EUR")])));
    }

    #[test]
    fn ordering_compares_text() {
        let condition = Condition::parse("@qty >= '10'").expect("parse");
        assert!(condition.evaluate(&attrs(&[("qty", "10")])));
        assert!(condition.evaluate(&attrs(&[("qty", "100")])));
        assert!(condition.evaluate(&attrs(&[("qty", "9")])));
        assert!(!condition.evaluate(&attrs(&[("qty", "09")])));
        assert!(!condition.evaluate(&attrs(&[("qty", "")])));
    }

    #[test]
    fn mixed_logical_operators_fail_to_parse() {
        let err = Condition::parse("(@a = '1') and (@b = '2') or (@c = '3')").unwrap_err();
        assert!(matches!(err, ConditionError::MixedLogicalOperators(_)));
        let nested = Condition::parse("((@a = '1') and (@b = '2')) or (@c = '3')");
        assert!(nested.is_ok());
    }

    #[test]
    fn malformed_conditions_report_descriptive_errors() {
        assert!(matches!(
            Condition::parse("@a 'x'"),
            Err(ConditionError::MissingOperator(_))
        ));
        assert!(matches!(
            Condition::parse("(@a = '1') and (@b = '2'"),
            Err(ConditionError::UnbalancedBrackets(_))
        ));
        assert!(matches!(
            Condition::parse("@a = 'x"),
            Err(ConditionError::UnterminatedLiteral(_))
        ));
        assert!(matches!(
            Condition::parse("@a = 'x' and @b = 'y'"),
            Err(ConditionError::MixedLogicalOperators(_))
        ));
        assert!(matches!(
            Condition::parse(" = 'x'"),
            Err(ConditionError::EmptyOperand(_))
        ));
    }

    #[test]
    fn attribute_assignments_follow_and_chain() {
        let condition =
            Condition::parse("(@ccy = CURRENCY) and (@type = 'NAV') and (@qty > '0')").expect("parse");
        let source = attrs(&[("CURRENCY", "EUR")]);
        assert_eq!(
            condition.attribute_assignments(&source),
            vec![
                ("ccy".to_string(), "EUR".to_string()),
                ("type".to_string(), "NAV".to_string())
            ]
        );
        assert_eq!(condition.references(), vec!["CURRENCY"]);
    }
}
