//! Expression trees for calculated series: a node model plus the generic
//! walkers (evaluate, print, rewrite, simplify, duplicate caching) built on
//! top of it.
//!
//! Trees are immutable and share subtrees through [`NodeRef`]; every rewrite
//! produces a new tree and reuses untouched branches.

use crate::error::TimeSeriesError;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

/// Shared handle to an expression node.
pub type NodeRef = Arc<NodeCalc>;

/// Recursion bound for [`simplify`]. Deeper trees abort with
/// [`TimeSeriesError::TooManyRecursion`] instead of risking the stack.
pub const MAX_SIMPLIFY_DEPTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BinaryOperator {
    Plus,
    Minus,
    Multiply,
    Divide,
    LessThan,
    LessThanOrEqualsTo,
    GreaterThan,
    GreaterThanOrEqualsTo,
    EqualsTo,
    NotEqualsTo,
}

impl BinaryOperator {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqualsTo => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqualsTo => ">=",
            BinaryOperator::EqualsTo => "==",
            BinaryOperator::NotEqualsTo => "!=",
        }
    }

    fn apply(self, left: f64, right: f64) -> f64 {
        fn truth(b: bool) -> f64 {
            if b {
                1.0
            } else {
                0.0
            }
        }
        match self {
            BinaryOperator::Plus => left + right,
            BinaryOperator::Minus => left - right,
            BinaryOperator::Multiply => left * right,
            BinaryOperator::Divide => left / right,
            BinaryOperator::LessThan => truth(left < right),
            BinaryOperator::LessThanOrEqualsTo => truth(left <= right),
            BinaryOperator::GreaterThan => truth(left > right),
            BinaryOperator::GreaterThanOrEqualsTo => truth(left >= right),
            BinaryOperator::EqualsTo => truth(left == right),
            BinaryOperator::NotEqualsTo => truth(left != right),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnaryOperator {
    Abs,
    Negative,
    Positive,
}

impl UnaryOperator {
    fn apply(self, value: f64) -> f64 {
        match self {
            UnaryOperator::Abs => value.abs(),
            UnaryOperator::Negative => -value,
            UnaryOperator::Positive => value,
        }
    }
}

/// One node of a calculated-series expression. The externally tagged serde
/// representation is the wire format: `{"integer":1}`,
/// `{"binaryOp":{"op":"PLUS","left":...,"right":...}}`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeCalc {
    Integer(i32),
    // serde_json writes non-finite literals as null; read null back as NaN
    Float(#[serde(deserialize_with = "f32_or_null")] f32),
    Double(#[serde(deserialize_with = "f64_or_null")] f64),
    /// Unresolved reference to a stored series, by name.
    TimeSeriesName(String),
    /// Resolved reference to a stored series, by column number.
    TimeSeriesNum(i32),
    /// Evaluates to the current instant in epoch milliseconds.
    Time(NodeRef),
    BinaryOp {
        op: BinaryOperator,
        left: NodeRef,
        right: NodeRef,
    },
    BinaryMin {
        left: NodeRef,
        right: NodeRef,
    },
    BinaryMax {
        left: NodeRef,
        right: NodeRef,
    },
    UnaryOp {
        op: UnaryOperator,
        child: NodeRef,
    },
    /// Clamp below: `min(child, value)`.
    Min {
        child: NodeRef,
        value: f64,
    },
    /// Clamp above: `max(child, value)`.
    Max {
        child: NodeRef,
        value: f64,
    },
    /// Marks a shared subtree whose value is memoized per evaluation pass.
    /// Memoization lives in a side table keyed by `id`, never in the node.
    Cached {
        id: u64,
        child: NodeRef,
    },
}

fn f64_or_null<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn f32_or_null<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
}

impl NodeCalc {
    pub fn integer(value: i32) -> NodeRef {
        Arc::new(NodeCalc::Integer(value))
    }

    pub fn double(value: f64) -> NodeRef {
        Arc::new(NodeCalc::Double(value))
    }

    pub fn time_series_name(name: impl Into<String>) -> NodeRef {
        Arc::new(NodeCalc::TimeSeriesName(name.into()))
    }

    pub fn time_series_num(num: i32) -> NodeRef {
        Arc::new(NodeCalc::TimeSeriesNum(num))
    }

    pub fn binary(op: BinaryOperator, left: NodeRef, right: NodeRef) -> NodeRef {
        Arc::new(NodeCalc::BinaryOp { op, left, right })
    }

    pub fn plus(left: NodeRef, right: NodeRef) -> NodeRef {
        Self::binary(BinaryOperator::Plus, left, right)
    }

    pub fn minus(left: NodeRef, right: NodeRef) -> NodeRef {
        Self::binary(BinaryOperator::Minus, left, right)
    }

    pub fn multiply(left: NodeRef, right: NodeRef) -> NodeRef {
        Self::binary(BinaryOperator::Multiply, left, right)
    }

    pub fn divide(left: NodeRef, right: NodeRef) -> NodeRef {
        Self::binary(BinaryOperator::Divide, left, right)
    }

    pub fn unary(op: UnaryOperator, child: NodeRef) -> NodeRef {
        Arc::new(NodeCalc::UnaryOp { op, child })
    }

    pub fn binary_min(left: NodeRef, right: NodeRef) -> NodeRef {
        Arc::new(NodeCalc::BinaryMin { left, right })
    }

    pub fn binary_max(left: NodeRef, right: NodeRef) -> NodeRef {
        Arc::new(NodeCalc::BinaryMax { left, right })
    }

    pub fn min(child: NodeRef, value: f64) -> NodeRef {
        Arc::new(NodeCalc::Min { child, value })
    }

    pub fn max(child: NodeRef, value: f64) -> NodeRef {
        Arc::new(NodeCalc::Max { child, value })
    }

    pub fn time(child: NodeRef) -> NodeRef {
        Arc::new(NodeCalc::Time(child))
    }

    /// Literal value if the node is a numeric constant.
    fn literal_value(&self) -> Option<f64> {
        match self {
            NodeCalc::Integer(v) => Some(f64::from(*v)),
            NodeCalc::Float(v) => Some(f64::from(*v)),
            NodeCalc::Double(v) => Some(*v),
            _ => None,
        }
    }
}

/// Per-position inputs of an expression evaluation.
pub trait EvaluationContext {
    /// Value of the series bound to column `num` at the current position.
    fn series_value(&self, num: i32) -> Result<f64, TimeSeriesError>;

    /// Value of the named series at the current position. Called for
    /// references [`resolve_references`] has not rewritten.
    fn series_value_by_name(&self, name: &str) -> Result<f64, TimeSeriesError>;

    /// Instant of the current position, epoch milliseconds.
    fn current_time(&self) -> Timestamp;
}

/// Evaluates a tree against one position. Cached subtrees are computed once
/// per call; results live in a local side table and are dropped on return.
pub fn evaluate(node: &NodeCalc, ctx: &dyn EvaluationContext) -> Result<f64, TimeSeriesError> {
    let mut memo = HashMap::new();
    evaluate_memo(node, ctx, &mut memo)
}

fn evaluate_memo(
    node: &NodeCalc,
    ctx: &dyn EvaluationContext,
    memo: &mut HashMap<u64, f64>,
) -> Result<f64, TimeSeriesError> {
    Ok(match node {
        NodeCalc::Integer(v) => f64::from(*v),
        NodeCalc::Float(v) => f64::from(*v),
        NodeCalc::Double(v) => *v,
        NodeCalc::TimeSeriesName(name) => ctx.series_value_by_name(name)?,
        NodeCalc::TimeSeriesNum(num) => ctx.series_value(*num)?,
        NodeCalc::Time(_) => ctx.current_time() as f64,
        NodeCalc::BinaryOp { op, left, right } => {
            op.apply(evaluate_memo(left, ctx, memo)?, evaluate_memo(right, ctx, memo)?)
        }
        NodeCalc::BinaryMin { left, right } => {
            evaluate_memo(left, ctx, memo)?.min(evaluate_memo(right, ctx, memo)?)
        }
        NodeCalc::BinaryMax { left, right } => {
            evaluate_memo(left, ctx, memo)?.max(evaluate_memo(right, ctx, memo)?)
        }
        NodeCalc::UnaryOp { op, child } => op.apply(evaluate_memo(child, ctx, memo)?),
        NodeCalc::Min { child, value } => evaluate_memo(child, ctx, memo)?.min(*value),
        NodeCalc::Max { child, value } => evaluate_memo(child, ctx, memo)?.max(*value),
        NodeCalc::Cached { id, child } => {
            if let Some(&value) = memo.get(id) {
                value
            } else {
                let value = evaluate_memo(child, ctx, memo)?;
                memo.insert(*id, value);
                value
            }
        }
    })
}

/// Renders a tree as a fully parenthesized infix expression. Cache markers
/// are transparent.
pub fn print(node: &NodeCalc) -> String {
    let mut out = String::new();
    print_to(node, &mut out);
    out
}

fn print_to(node: &NodeCalc, out: &mut String) {
    match node {
        NodeCalc::Integer(v) => {
            let _ = write!(out, "{v}");
        }
        NodeCalc::Float(v) => {
            let _ = write!(out, "{v}");
        }
        NodeCalc::Double(v) => {
            let _ = write!(out, "{v}");
        }
        NodeCalc::TimeSeriesName(name) => out.push_str(name),
        NodeCalc::TimeSeriesNum(num) => {
            let _ = write!(out, "timeSeries[{num}]");
        }
        NodeCalc::Time(child) => {
            out.push_str("time(");
            print_to(child, out);
            out.push(')');
        }
        NodeCalc::BinaryOp { op, left, right } => {
            out.push('(');
            print_to(left, out);
            out.push_str(&format!(" {} ", op.symbol()));
            print_to(right, out);
            out.push(')');
        }
        NodeCalc::BinaryMin { left, right } => {
            out.push_str("min(");
            print_to(left, out);
            out.push_str(", ");
            print_to(right, out);
            out.push(')');
        }
        NodeCalc::BinaryMax { left, right } => {
            out.push_str("max(");
            print_to(left, out);
            out.push_str(", ");
            print_to(right, out);
            out.push(')');
        }
        NodeCalc::UnaryOp { op, child } => match op {
            UnaryOperator::Abs => {
                out.push_str("abs(");
                print_to(child, out);
                out.push(')');
            }
            UnaryOperator::Negative => {
                out.push_str("(-");
                print_to(child, out);
                out.push(')');
            }
            UnaryOperator::Positive => {
                out.push_str("(+");
                print_to(child, out);
                out.push(')');
            }
        },
        NodeCalc::Min { child, value } => {
            out.push_str("min(");
            print_to(child, out);
            let _ = write!(out, ", {value})");
        }
        NodeCalc::Max { child, value } => {
            out.push_str("max(");
            print_to(child, out);
            let _ = write!(out, ", {value})");
        }
        NodeCalc::Cached { child, .. } => print_to(child, out),
    }
}

fn children(node: &NodeCalc) -> Vec<&NodeRef> {
    match node {
        NodeCalc::Integer(_)
        | NodeCalc::Float(_)
        | NodeCalc::Double(_)
        | NodeCalc::TimeSeriesName(_)
        | NodeCalc::TimeSeriesNum(_) => Vec::new(),
        NodeCalc::Time(child)
        | NodeCalc::UnaryOp { child, .. }
        | NodeCalc::Min { child, .. }
        | NodeCalc::Max { child, .. }
        | NodeCalc::Cached { child, .. } => vec![child],
        NodeCalc::BinaryOp { left, right, .. }
        | NodeCalc::BinaryMin { left, right }
        | NodeCalc::BinaryMax { left, right } => vec![left, right],
    }
}

fn with_children(node: &NodeRef, new_children: Vec<NodeRef>) -> NodeRef {
    let old = children(node);
    if old
        .iter()
        .zip(new_children.iter())
        .all(|(a, b)| Arc::ptr_eq(a, b))
    {
        return Arc::clone(node);
    }
    let mut it = new_children.into_iter();
    let mut next = || it.next().expect("child arity preserved");
    Arc::new(match node.as_ref() {
        NodeCalc::Time(_) => NodeCalc::Time(next()),
        NodeCalc::UnaryOp { op, .. } => NodeCalc::UnaryOp {
            op: *op,
            child: next(),
        },
        NodeCalc::Min { value, .. } => NodeCalc::Min {
            child: next(),
            value: *value,
        },
        NodeCalc::Max { value, .. } => NodeCalc::Max {
            child: next(),
            value: *value,
        },
        NodeCalc::Cached { id, .. } => NodeCalc::Cached {
            id: *id,
            child: next(),
        },
        NodeCalc::BinaryOp { op, .. } => NodeCalc::BinaryOp {
            op: *op,
            left: next(),
            right: next(),
        },
        NodeCalc::BinaryMin { .. } => NodeCalc::BinaryMin {
            left: next(),
            right: next(),
        },
        NodeCalc::BinaryMax { .. } => NodeCalc::BinaryMax {
            left: next(),
            right: next(),
        },
        leaf => leaf.clone(),
    })
}

/// Bottom-up rewrite. Children are rebuilt first, then `rewrite` is applied
/// to the node itself; untouched branches keep their original [`Arc`].
pub fn transform<F>(node: &NodeRef, rewrite: &mut F) -> NodeRef
where
    F: FnMut(NodeRef) -> NodeRef,
{
    let new_children: Vec<NodeRef> = children(node)
        .into_iter()
        .map(|child| transform(child, rewrite))
        .collect();
    rewrite(with_children(node, new_children))
}

/// Replaces every [`NodeCalc::TimeSeriesName`] with the column number the
/// map assigns to it. Unknown names fail the whole rewrite.
pub fn resolve_references(
    node: &NodeRef,
    numbers: &HashMap<String, i32>,
) -> Result<NodeRef, TimeSeriesError> {
    let mut missing: Option<String> = None;
    let resolved = transform(node, &mut |n| {
        if let NodeCalc::TimeSeriesName(name) = n.as_ref() {
            match numbers.get(name) {
                Some(&num) => return NodeCalc::time_series_num(num),
                None => {
                    if missing.is_none() {
                        missing = Some(name.clone());
                    }
                }
            }
        }
        n
    });
    match missing {
        Some(name) => Err(TimeSeriesError::SeriesNotFound(name)),
        None => Ok(resolved),
    }
}

/// Names of all stored series the tree references, sorted.
pub fn referenced_names(node: &NodeCalc) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_names(node, &mut names);
    names
}

fn collect_names(node: &NodeCalc, names: &mut BTreeSet<String>) {
    if let NodeCalc::TimeSeriesName(name) = node {
        names.insert(name.clone());
    }
    for child in children(node) {
        collect_names(child, names);
    }
}

/// Constant-folds the tree. Integer addition, subtraction and multiplication
/// stay integer when they fit; everything else folds to a double. Trees
/// deeper than [`MAX_SIMPLIFY_DEPTH`] abort.
pub fn simplify(node: &NodeRef) -> Result<NodeRef, TimeSeriesError> {
    simplify_depth(node, 0)
}

fn simplify_depth(node: &NodeRef, depth: usize) -> Result<NodeRef, TimeSeriesError> {
    if depth > MAX_SIMPLIFY_DEPTH {
        return Err(TimeSeriesError::TooManyRecursion {
            depth,
            node: Arc::clone(node),
        });
    }
    let new_children = children(node)
        .into_iter()
        .map(|child| simplify_depth(child, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    let rebuilt = with_children(node, new_children);
    Ok(fold(&rebuilt).unwrap_or(rebuilt))
}

fn fold(node: &NodeRef) -> Option<NodeRef> {
    match node.as_ref() {
        NodeCalc::BinaryOp { op, left, right } => {
            let l = left.literal_value()?;
            let r = right.literal_value()?;
            if let (
                NodeCalc::Integer(li),
                NodeCalc::Integer(ri),
                BinaryOperator::Plus | BinaryOperator::Minus | BinaryOperator::Multiply,
            ) = (left.as_ref(), right.as_ref(), op)
            {
                let exact = match op {
                    BinaryOperator::Plus => li.checked_add(*ri),
                    BinaryOperator::Minus => li.checked_sub(*ri),
                    _ => li.checked_mul(*ri),
                };
                // overflow falls through to the double fold below
                if let Some(v) = exact {
                    return Some(NodeCalc::integer(v));
                }
            }
            Some(NodeCalc::double(op.apply(l, r)))
        }
        NodeCalc::BinaryMin { left, right } => Some(NodeCalc::double(
            left.literal_value()?.min(right.literal_value()?),
        )),
        NodeCalc::BinaryMax { left, right } => Some(NodeCalc::double(
            left.literal_value()?.max(right.literal_value()?),
        )),
        NodeCalc::UnaryOp { op, child } => {
            let v = child.literal_value()?;
            if let (NodeCalc::Integer(i), UnaryOperator::Negative) = (child.as_ref(), op) {
                if let Some(n) = i.checked_neg() {
                    return Some(NodeCalc::integer(n));
                }
            }
            Some(NodeCalc::double(op.apply(v)))
        }
        NodeCalc::Min { child, value } => {
            Some(NodeCalc::double(child.literal_value()?.min(*value)))
        }
        NodeCalc::Max { child, value } => {
            Some(NodeCalc::double(child.literal_value()?.max(*value)))
        }
        NodeCalc::Cached { child, .. } => {
            // a cached literal has nothing left worth memoizing
            child.literal_value().map(|_| Arc::clone(child))
        }
        _ => None,
    }
}

/// Wraps every subtree referenced from more than one parent in a
/// [`NodeCalc::Cached`] marker so evaluation computes it once. Sharing is
/// detected by pointer identity and preserved in the result; literals and
/// existing markers are never wrapped.
pub fn cache_duplicated(root: &NodeRef) -> NodeRef {
    let mut counts: HashMap<*const NodeCalc, usize> = HashMap::new();
    count_parents(root, &mut counts);
    let mut memo: HashMap<*const NodeCalc, NodeRef> = HashMap::new();
    let mut next_id: u64 = 0;
    wrap_shared(root, &counts, &mut memo, &mut next_id)
}

fn count_parents(node: &NodeRef, counts: &mut HashMap<*const NodeCalc, usize>) {
    let entry = counts.entry(Arc::as_ptr(node)).or_insert(0);
    *entry += 1;
    if *entry > 1 {
        // already traversed below this node
        return;
    }
    for child in children(node) {
        count_parents(child, counts);
    }
}

fn cacheable(node: &NodeCalc) -> bool {
    !matches!(
        node,
        NodeCalc::Integer(_) | NodeCalc::Float(_) | NodeCalc::Double(_) | NodeCalc::Cached { .. }
    )
}

fn wrap_shared(
    node: &NodeRef,
    counts: &HashMap<*const NodeCalc, usize>,
    memo: &mut HashMap<*const NodeCalc, NodeRef>,
    next_id: &mut u64,
) -> NodeRef {
    let ptr = Arc::as_ptr(node);
    if let Some(done) = memo.get(&ptr) {
        return Arc::clone(done);
    }
    let new_children: Vec<NodeRef> = children(node)
        .into_iter()
        .map(|child| wrap_shared(child, counts, memo, next_id))
        .collect();
    let rebuilt = with_children(node, new_children);
    let result = if counts.get(&ptr).copied().unwrap_or(0) > 1 && cacheable(node) {
        let id = *next_id;
        *next_id += 1;
        Arc::new(NodeCalc::Cached { id, child: rebuilt })
    } else {
        rebuilt
    };
    memo.insert(ptr, Arc::clone(&result));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedContext {
        values: HashMap<i32, f64>,
        names: HashMap<String, f64>,
        time: Timestamp,
    }

    impl FixedContext {
        fn new() -> Self {
            FixedContext {
                values: HashMap::new(),
                names: HashMap::new(),
                time: 0,
            }
        }
    }

    impl EvaluationContext for FixedContext {
        fn series_value(&self, num: i32) -> Result<f64, TimeSeriesError> {
            self.values
                .get(&num)
                .copied()
                .ok_or_else(|| TimeSeriesError::SeriesNotFound(format!("timeSeries[{num}]")))
        }

        fn series_value_by_name(&self, name: &str) -> Result<f64, TimeSeriesError> {
            self.names
                .get(name)
                .copied()
                .ok_or_else(|| TimeSeriesError::SeriesNotFound(name.to_string()))
        }

        fn current_time(&self) -> Timestamp {
            self.time
        }
    }

    #[test]
    fn evaluate_arithmetic_and_comparisons() {
        let mut ctx = FixedContext::new();
        ctx.values.insert(0, 4.0);
        let node = NodeCalc::plus(
            NodeCalc::multiply(NodeCalc::time_series_num(0), NodeCalc::integer(2)),
            NodeCalc::double(1.5),
        );
        assert_eq!(9.5, evaluate(&node, &ctx).unwrap());

        let cmp = NodeCalc::binary(
            BinaryOperator::GreaterThanOrEqualsTo,
            NodeCalc::time_series_num(0),
            NodeCalc::integer(4),
        );
        assert_eq!(1.0, evaluate(&cmp, &ctx).unwrap());
        let cmp = NodeCalc::binary(
            BinaryOperator::NotEqualsTo,
            NodeCalc::time_series_num(0),
            NodeCalc::integer(4),
        );
        assert_eq!(0.0, evaluate(&cmp, &ctx).unwrap());
    }

    #[test]
    fn evaluate_clamps_and_time() {
        let mut ctx = FixedContext::new();
        ctx.values.insert(0, 10.0);
        ctx.time = 5000;
        assert_eq!(
            3.0,
            evaluate(&NodeCalc::min(NodeCalc::time_series_num(0), 3.0), &ctx).unwrap()
        );
        assert_eq!(
            10.0,
            evaluate(&NodeCalc::max(NodeCalc::time_series_num(0), 3.0), &ctx).unwrap()
        );
        assert_eq!(
            5000.0,
            evaluate(&NodeCalc::time(NodeCalc::time_series_num(0)), &ctx).unwrap()
        );
        assert_eq!(
            7.0,
            evaluate(
                &NodeCalc::binary_min(NodeCalc::time_series_num(0), NodeCalc::double(7.0)),
                &ctx
            )
            .unwrap()
        );
    }

    #[test]
    fn evaluate_missing_series_fails() {
        let ctx = FixedContext::new();
        assert!(matches!(
            evaluate(&NodeCalc::time_series_name("nope"), &ctx),
            Err(TimeSeriesError::SeriesNotFound(_))
        ));
    }

    #[test]
    fn print_is_parenthesized_infix() {
        let node = NodeCalc::multiply(
            NodeCalc::plus(NodeCalc::time_series_name("a"), NodeCalc::integer(1)),
            NodeCalc::unary(UnaryOperator::Negative, NodeCalc::time_series_name("b")),
        );
        assert_eq!("((a + 1) * (-b))", print(&node));
        assert_eq!(
            "min(timeSeries[2], 4)",
            print(&NodeCalc::min(NodeCalc::time_series_num(2), 4.0))
        );
    }

    #[test]
    fn print_ignores_cache_markers() {
        let shared = NodeCalc::plus(NodeCalc::time_series_name("a"), NodeCalc::integer(1));
        let cached = cache_duplicated(&NodeCalc::multiply(Arc::clone(&shared), shared));
        assert_eq!("((a + 1) * (a + 1))", print(&cached));
    }

    #[test]
    fn resolve_references_rewrites_names() {
        let node = NodeCalc::plus(
            NodeCalc::time_series_name("a"),
            NodeCalc::time_series_name("b"),
        );
        let mut numbers = HashMap::new();
        numbers.insert("a".to_string(), 0);
        numbers.insert("b".to_string(), 1);
        let resolved = resolve_references(&node, &numbers).unwrap();
        assert_eq!("(timeSeries[0] + timeSeries[1])", print(&resolved));

        numbers.remove("b");
        assert!(matches!(
            resolve_references(&node, &numbers),
            Err(TimeSeriesError::SeriesNotFound(name)) if name == "b"
        ));
    }

    #[test]
    fn transform_keeps_untouched_branches() {
        let left = NodeCalc::time_series_name("a");
        let node = NodeCalc::plus(Arc::clone(&left), NodeCalc::time_series_name("b"));
        let rewritten = transform(&node, &mut |n| {
            if matches!(n.as_ref(), NodeCalc::TimeSeriesName(name) if name == "b") {
                NodeCalc::time_series_num(7)
            } else {
                n
            }
        });
        if let NodeCalc::BinaryOp { left: l, right: r, .. } = rewritten.as_ref() {
            assert!(Arc::ptr_eq(l, &left));
            assert_eq!(NodeCalc::TimeSeriesNum(7), *r.as_ref());
        } else {
            panic!("binary node expected");
        }
        // identity rewrite returns the same tree
        let same = transform(&node, &mut |n| n);
        assert!(Arc::ptr_eq(&same, &node));
    }

    #[test]
    fn simplify_folds_constants() {
        let node = NodeCalc::plus(NodeCalc::integer(2), NodeCalc::integer(3));
        assert_eq!(NodeCalc::Integer(5), *simplify(&node).unwrap().as_ref());

        let node = NodeCalc::divide(NodeCalc::integer(1), NodeCalc::integer(2));
        assert_eq!(NodeCalc::Double(0.5), *simplify(&node).unwrap().as_ref());

        let node = NodeCalc::plus(
            NodeCalc::time_series_name("a"),
            NodeCalc::multiply(NodeCalc::integer(2), NodeCalc::integer(10)),
        );
        assert_eq!("(a + 20)", print(&simplify(&node).unwrap()));

        let node = NodeCalc::unary(UnaryOperator::Negative, NodeCalc::integer(4));
        assert_eq!(NodeCalc::Integer(-4), *simplify(&node).unwrap().as_ref());

        let node = NodeCalc::min(NodeCalc::integer(9), 4.0);
        assert_eq!(NodeCalc::Double(4.0), *simplify(&node).unwrap().as_ref());
    }

    #[test]
    fn simplify_integer_overflow_widens() {
        let node = NodeCalc::plus(NodeCalc::integer(i32::MAX), NodeCalc::integer(1));
        assert_eq!(
            NodeCalc::Double(f64::from(i32::MAX) + 1.0),
            *simplify(&node).unwrap().as_ref()
        );
    }

    #[test]
    fn simplify_rejects_very_deep_trees() {
        let mut node = NodeCalc::integer(0);
        for _ in 0..(MAX_SIMPLIFY_DEPTH + 10) {
            node = NodeCalc::plus(node, NodeCalc::integer(1));
        }
        assert!(matches!(
            simplify(&node),
            Err(TimeSeriesError::TooManyRecursion { .. })
        ));
    }

    #[test]
    fn cache_duplicated_wraps_shared_subtrees_once() {
        let shared = NodeCalc::plus(NodeCalc::time_series_name("a"), NodeCalc::integer(1));
        let root = NodeCalc::multiply(Arc::clone(&shared), Arc::clone(&shared));
        let cached = cache_duplicated(&root);
        if let NodeCalc::BinaryOp { left, right, .. } = cached.as_ref() {
            assert!(matches!(left.as_ref(), NodeCalc::Cached { .. }));
            // both parents point at the same marker
            assert!(Arc::ptr_eq(left, right));
        } else {
            panic!("binary node expected");
        }
        // evaluation result is unchanged
        let mut ctx = FixedContext::new();
        ctx.names.insert("a".to_string(), 2.0);
        assert_eq!(evaluate(&root, &ctx).unwrap(), evaluate(&cached, &ctx).unwrap());
    }

    #[test]
    fn cache_duplicated_skips_literals_and_unshared_nodes() {
        let literal = NodeCalc::integer(1);
        let root = NodeCalc::plus(Arc::clone(&literal), literal);
        let cached = cache_duplicated(&root);
        assert!(Arc::ptr_eq(&cached, &root));

        let unshared = NodeCalc::plus(
            NodeCalc::time_series_name("a"),
            NodeCalc::time_series_name("b"),
        );
        assert!(Arc::ptr_eq(&cache_duplicated(&unshared), &unshared));
    }

    #[test]
    fn referenced_names_are_sorted_and_deduplicated() {
        let node = NodeCalc::plus(
            NodeCalc::time_series_name("b"),
            NodeCalc::multiply(
                NodeCalc::time_series_name("a"),
                NodeCalc::time_series_name("b"),
            ),
        );
        let names: Vec<String> = referenced_names(&node).into_iter().collect();
        assert_eq!(vec!["a".to_string(), "b".to_string()], names);
    }

    #[test]
    fn wire_json_shape() {
        let node = NodeCalc::binary(
            BinaryOperator::Plus,
            NodeCalc::time_series_name("ts"),
            NodeCalc::integer(1),
        );
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(
            r#"{"binaryOp":{"op":"PLUS","left":{"timeSeriesName":"ts"},"right":{"integer":1}}}"#,
            json
        );
        let back: NodeCalc = serde_json::from_str(&json).unwrap();
        assert_eq!(node.as_ref(), &back);
    }

    #[test]
    fn nan_literal_survives_the_wire() {
        let json = serde_json::to_string(&NodeCalc::Double(f64::NAN)).unwrap();
        assert_eq!(r#"{"double":null}"#, json);
        match serde_json::from_str::<NodeCalc>(&json).unwrap() {
            NodeCalc::Double(v) => assert!(v.is_nan()),
            other => panic!("double literal expected, got {other:?}"),
        }
        match serde_json::from_str::<NodeCalc>(r#"{"float":null}"#).unwrap() {
            NodeCalc::Float(v) => assert!(v.is_nan()),
            other => panic!("float literal expected, got {other:?}"),
        }
    }
}
