use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::machine::{NativeError, Signal};
use crate::value::{Complete, Completer, Feature, Literal, Value};
use crate::var::{ValueOrVar, Var};

/// A record label that may still be an unbound variable.
#[derive(Clone, Debug)]
pub enum LiteralOrVar {
    Literal(Literal),
    Var(Var),
}

impl LiteralOrVar {
    fn resolve(&self) -> Result<Literal, Signal> {
        match self {
            LiteralOrVar::Literal(literal) => Ok(literal.clone()),
            LiteralOrVar::Var(var) => match var.resolve_value_or_var() {
                ValueOrVar::Value(Value::Literal(literal)) => Ok(literal),
                ValueOrVar::Value(other) => Err(Signal::Native(NativeError::type_error(&format!(
                    "not a literal: {other}"
                )))),
                ValueOrVar::Var(unbound) => Err(Signal::Wait(unbound)),
            },
        }
    }
}

/// A record feature that may still be an unbound variable.
#[derive(Clone, Debug)]
pub enum FeatureOrVar {
    Feature(Feature),
    Var(Var),
}

impl FeatureOrVar {
    fn resolve(&self) -> Result<Feature, Signal> {
        match self {
            FeatureOrVar::Feature(feature) => Ok(feature.clone()),
            FeatureOrVar::Var(var) => match var.resolve_value_or_var() {
                ValueOrVar::Value(Value::Literal(literal)) => {
                    Feature::try_from(&literal).map_err(Signal::Native)
                }
                ValueOrVar::Value(other) => Err(Signal::Native(NativeError::type_error(&format!(
                    "not a feature: {other}"
                )))),
                ValueOrVar::Var(unbound) => Err(Signal::Wait(unbound)),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct PartialField {
    pub feature: FeatureOrVar,
    pub value: ValueOrVar,
}

/// A record under construction: label, features, and field values may all be
/// unbound. Interior mutability backs the union rule of unification, which
/// can grow a partial record with features learned from the other side.
#[derive(Debug)]
pub struct PartialRec {
    inner: Mutex<Vec<PartialField>>,
    label: LiteralOrVar,
}

impl PartialRec {
    pub fn new(label: LiteralOrVar, fields: Vec<PartialField>) -> PartialRec {
        PartialRec {
            label,
            inner: Mutex::new(fields),
        }
    }

    fn snapshot(&self) -> Vec<PartialField> {
        self.inner.lock().expect("partial rec lock").clone()
    }

    /// Add a feature learned from unification, unless it is already present.
    fn add_field(&self, feature: Feature, value: ValueOrVar) -> Result<(), Signal> {
        let mut fields = self.inner.lock().expect("partial rec lock");
        for field in fields.iter() {
            if let FeatureOrVar::Feature(existing) = &field.feature {
                if *existing == feature {
                    return Ok(());
                }
            }
        }
        fields.push(PartialField {
            feature: FeatureOrVar::Feature(feature),
            value,
        });
        Ok(())
    }
}

/// A tuple under construction: fixed arity, but the label and the values may
/// be unbound.
#[derive(Debug)]
pub struct PartialTuple {
    pub label: LiteralOrVar,
    pub values: Vec<ValueOrVar>,
}

/// A complete record: literal label and fields sorted by feature.
#[derive(Debug)]
pub struct CompleteRec {
    label: Literal,
    fields: Vec<(Feature, Complete)>,
}

impl CompleteRec {
    pub fn build(
        label: Literal,
        mut fields: Vec<(Feature, Complete)>,
    ) -> Result<CompleteRec, NativeError> {
        fields.sort_by(|(a, _), (b, _)| a.cmp(b));
        for pair in fields.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(NativeError::type_error(&format!(
                    "duplicate feature: {}",
                    pair[0].0
                )));
            }
        }
        Ok(CompleteRec { label, fields })
    }

    pub fn label(&self) -> &Literal {
        &self.label
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_at(&self, index: usize) -> Option<&(Feature, Complete)> {
        self.fields.get(index)
    }

    pub fn find_value(&self, feature: &Feature) -> Option<&Complete> {
        self.fields
            .binary_search_by(|(f, _)| f.cmp(feature))
            .ok()
            .map(|index| &self.fields[index].1)
    }

    pub fn fields(&self) -> impl Iterator<Item = &(Feature, Complete)> {
        self.fields.iter()
    }

    pub fn entails(&self, other: &CompleteRec) -> bool {
        self.label == other.label
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((fa, va), (fb, vb))| fa == fb && va.entails(vb))
    }
}

impl fmt::Display for CompleteRec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label != Literal::Nothing {
            write!(f, "{}#", self.label)?;
        }
        write!(f, "{{")?;
        for (index, (feature, value)) in self.fields.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{feature}: {value}")?;
        }
        write!(f, "}}")
    }
}

/// A complete tuple: integer features `0..n-1` in insertion order.
#[derive(Debug)]
pub struct CompleteTuple {
    label: Literal,
    values: Vec<Complete>,
}

impl CompleteTuple {
    pub fn new(label: Literal, values: Vec<Complete>) -> CompleteTuple {
        CompleteTuple { label, values }
    }

    pub fn label(&self) -> &Literal {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_at(&self, index: usize) -> Option<&Complete> {
        self.values.get(index)
    }

    pub fn values(&self) -> impl Iterator<Item = &Complete> {
        self.values.iter()
    }

    pub fn entails(&self, other: &CompleteTuple) -> bool {
        self.label == other.label
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a.entails(b))
    }
}

impl fmt::Display for CompleteTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label != Literal::Nothing {
            write!(f, "{}#", self.label)?;
        }
        write!(f, "[")?;
        for (index, value) in self.values.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "]")
    }
}

#[derive(Clone, Debug)]
pub enum RecVal {
    Partial(Arc<PartialRec>),
    Complete(Arc<CompleteRec>),
}

impl RecVal {
    pub fn label(&self) -> Result<Literal, Signal> {
        match self {
            RecVal::Partial(p) => p.label.resolve(),
            RecVal::Complete(c) => Ok(c.label().clone()),
        }
    }

    pub fn field_count(&self) -> usize {
        match self {
            RecVal::Partial(p) => p.inner.lock().expect("partial rec lock").len(),
            RecVal::Complete(c) => c.field_count(),
        }
    }

    /// Look up a field value. Unbound features suspend.
    pub fn find_value_or_var(&self, feature: &Feature) -> Result<Option<ValueOrVar>, Signal> {
        match self {
            RecVal::Complete(c) => Ok(c
                .find_value(feature)
                .map(|value| ValueOrVar::Value(value.clone().into()))),
            RecVal::Partial(p) => {
                for field in p.snapshot() {
                    if field.feature.resolve()? == *feature {
                        return Ok(Some(field.value.clone()));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Select a field value; a missing feature is a feature-not-found error.
    pub fn select(&self, feature: &Feature) -> Result<ValueOrVar, Signal> {
        match self.find_value_or_var(feature)? {
            Some(value) => Ok(value),
            None => Err(Signal::Native(NativeError::feature_not_found(
                feature,
                &format!("{self}"),
            ))),
        }
    }

    pub(crate) fn check_complete(&self, completer: &mut Completer) -> Result<Arc<CompleteRec>, Signal> {
        match self {
            RecVal::Complete(c) => Ok(c.clone()),
            RecVal::Partial(p) => {
                let label = p.label.resolve()?;
                let mut fields = Vec::new();
                for field in p.snapshot() {
                    let feature = field.feature.resolve()?;
                    let value = completer.complete_value_or_var(&field.value)?;
                    fields.push((feature, value));
                }
                CompleteRec::build(label, fields)
                    .map(Arc::new)
                    .map_err(Signal::Native)
            }
        }
    }
}

impl fmt::Display for RecVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecVal::Complete(c) => write!(f, "{c}"),
            RecVal::Partial(p) => {
                match &p.label {
                    LiteralOrVar::Literal(label) if *label == Literal::Nothing => {}
                    LiteralOrVar::Literal(label) => write!(f, "{label}#")?,
                    LiteralOrVar::Var(var) => write!(f, "{var:?}#")?,
                }
                write!(f, "{{")?;
                for (index, field) in p.snapshot().iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    match &field.feature {
                        FeatureOrVar::Feature(feature) => write!(f, "{feature}: ")?,
                        FeatureOrVar::Var(var) => write!(f, "{var:?}: ")?,
                    }
                    write!(f, "{}", field.value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum TupleVal {
    Partial(Arc<PartialTuple>),
    Complete(Arc<CompleteTuple>),
}

impl fmt::Display for TupleVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleVal::Complete(c) => write!(f, "{c}"),
            TupleVal::Partial(p) => {
                match &p.label {
                    LiteralOrVar::Literal(label) if *label == Literal::Nothing => {}
                    LiteralOrVar::Literal(label) => write!(f, "{label}#")?,
                    LiteralOrVar::Var(var) => write!(f, "{var:?}#")?,
                }
                write!(f, "[")?;
                for (index, value) in p.values.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl TupleVal {
    pub fn label(&self) -> Result<Literal, Signal> {
        match self {
            TupleVal::Partial(p) => p.label.resolve(),
            TupleVal::Complete(c) => Ok(c.label().clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TupleVal::Partial(p) => p.values.len(),
            TupleVal::Complete(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value_at(&self, index: usize) -> Option<ValueOrVar> {
        match self {
            TupleVal::Partial(p) => p.values.get(index).cloned(),
            TupleVal::Complete(c) => c
                .value_at(index)
                .map(|value| ValueOrVar::Value(value.clone().into())),
        }
    }

    /// Tuples select by integer feature.
    pub fn select(&self, feature: &Feature) -> Result<ValueOrVar, Signal> {
        if let Feature::Int64(index) = feature {
            if *index >= 0 {
                if let Some(value) = self.value_at(*index as usize) {
                    return Ok(value);
                }
            }
        }
        Err(Signal::Native(NativeError::feature_not_found(
            feature,
            "a tuple",
        )))
    }

    pub(crate) fn check_complete(
        &self,
        completer: &mut Completer,
    ) -> Result<Arc<CompleteTuple>, Signal> {
        match self {
            TupleVal::Complete(c) => Ok(c.clone()),
            TupleVal::Partial(p) => {
                let label = p.label.resolve()?;
                let mut values = Vec::new();
                for value in &p.values {
                    values.push(completer.complete_value_or_var(value)?);
                }
                Ok(Arc::new(CompleteTuple::new(label, values)))
            }
        }
    }
}

/// Unify two records: labels must agree, fields of common features unify,
/// and extra features become the union where a side can still grow. A
/// feature present on a partial side but absent from a complete side is a
/// contradiction, since complete records are frozen.
pub fn unify_recs(a: &RecVal, b: &RecVal) -> Result<(), Signal> {
    if let (RecVal::Partial(pa), RecVal::Partial(pb)) = (a, b) {
        if Arc::ptr_eq(pa, pb) {
            return Ok(());
        }
    }
    if let (RecVal::Complete(ca), RecVal::Complete(cb)) = (a, b) {
        if Arc::ptr_eq(ca, cb) {
            return Ok(());
        }
    }
    let label_a = a.label()?;
    let label_b = b.label()?;
    if label_a != label_b {
        return Err(Signal::unification_msg(&format!(
            "labels differ: {label_a} and {label_b}"
        )));
    }
    let fields_a = resolved_fields(a)?;
    let fields_b = resolved_fields(b)?;
    let map_a: HashMap<&Feature, &ValueOrVar> = fields_a.iter().map(|(f, v)| (f, v)).collect();
    let map_b: HashMap<&Feature, &ValueOrVar> = fields_b.iter().map(|(f, v)| (f, v)).collect();

    // Unify common features first; suspension here leaves both sides
    // structurally untouched so the instruction can re-run.
    for (feature, value_a) in &fields_a {
        if let Some(value_b) = map_b.get(feature) {
            value_a.bind_value_or_var(value_b)?;
        }
    }
    // Features only on one side become the union, or a contradiction if the
    // other side is complete.
    for (feature, value_a) in &fields_a {
        if !map_b.contains_key(feature) {
            grow(b, feature, value_a)?;
        }
    }
    for (feature, value_b) in &fields_b {
        if !map_a.contains_key(feature) {
            grow(a, feature, value_b)?;
        }
    }
    Ok(())
}

fn resolved_fields(rec: &RecVal) -> Result<Vec<(Feature, ValueOrVar)>, Signal> {
    match rec {
        RecVal::Complete(c) => Ok(c
            .fields()
            .map(|(f, v)| (f.clone(), ValueOrVar::Value(v.clone().into())))
            .collect()),
        RecVal::Partial(p) => {
            let mut fields = Vec::new();
            for field in p.snapshot() {
                fields.push((field.feature.resolve()?, field.value.clone()));
            }
            Ok(fields)
        }
    }
}

fn grow(rec: &RecVal, feature: &Feature, value: &ValueOrVar) -> Result<(), Signal> {
    match rec {
        RecVal::Partial(p) => p.add_field(feature.clone(), value.clone()),
        RecVal::Complete(_) => Err(Signal::unification_msg(&format!(
            "feature {feature} is absent from a complete rec"
        ))),
    }
}

/// Unify two tuples: labels must agree, arities must match, and values unify
/// positionally.
pub fn unify_tuples(a: &TupleVal, b: &TupleVal) -> Result<(), Signal> {
    if let (TupleVal::Partial(pa), TupleVal::Partial(pb)) = (a, b) {
        if Arc::ptr_eq(pa, pb) {
            return Ok(());
        }
    }
    if let (TupleVal::Complete(ca), TupleVal::Complete(cb)) = (a, b) {
        if Arc::ptr_eq(ca, cb) {
            return Ok(());
        }
    }
    let label_a = a.label()?;
    let label_b = b.label()?;
    if label_a != label_b {
        return Err(Signal::unification_msg(&format!(
            "labels differ: {label_a} and {label_b}"
        )));
    }
    if a.len() != b.len() {
        return Err(Signal::unification_msg(&format!(
            "arities differ: {} and {}",
            a.len(),
            b.len()
        )));
    }
    for index in 0..a.len() {
        let (va, vb) = match (a.value_at(index), b.value_at(index)) {
            (Some(va), Some(vb)) => (va, vb),
            _ => break,
        };
        va.bind_value_or_var(&vb)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_rec(label: Literal, fields: Vec<(Feature, Complete)>) -> RecVal {
        RecVal::Complete(Arc::new(CompleteRec::build(label, fields).unwrap()))
    }

    fn partial_rec(label: Literal, fields: Vec<(Feature, ValueOrVar)>) -> RecVal {
        RecVal::Partial(Arc::new(PartialRec::new(
            LiteralOrVar::Literal(label),
            fields
                .into_iter()
                .map(|(feature, value)| PartialField {
                    feature: FeatureOrVar::Feature(feature),
                    value,
                })
                .collect(),
        )))
    }

    #[test]
    fn unify_binds_unbound_field() {
        // {a: 1, b: X} with {a: 1, b: 2} binds X <- 2
        let x = Var::new();
        let partial = partial_rec(
            Literal::Nothing,
            vec![
                (Feature::str("a"), ValueOrVar::Value(Complete::int(1).into())),
                (Feature::str("b"), ValueOrVar::Var(x.clone())),
            ],
        );
        let complete = complete_rec(
            Literal::Nothing,
            vec![
                (Feature::str("a"), Complete::int(1)),
                (Feature::str("b"), Complete::int(2)),
            ],
        );
        unify_recs(&partial, &complete).unwrap();
        match x.resolve_value_or_var() {
            ValueOrVar::Value(Value::Literal(Literal::Int64(2))) => {}
            other => panic!("unexpected binding: {other:?}"),
        }
    }

    #[test]
    fn unify_conflicting_fields_fails() {
        // {a: 1} with {a: 2} is a unification error
        let left = complete_rec(Literal::Nothing, vec![(Feature::str("a"), Complete::int(1))]);
        let right = complete_rec(Literal::Nothing, vec![(Feature::str("a"), Complete::int(2))]);
        assert!(unify_recs(&left, &right).is_err());
    }

    #[test]
    fn unify_unions_extra_features() {
        let left = partial_rec(
            Literal::Nothing,
            vec![(Feature::str("a"), ValueOrVar::Value(Complete::int(1).into()))],
        );
        let right = partial_rec(
            Literal::Nothing,
            vec![(Feature::str("b"), ValueOrVar::Value(Complete::int(2).into()))],
        );
        unify_recs(&left, &right).unwrap();
        assert_eq!(left.field_count(), 2);
        assert_eq!(right.field_count(), 2);
        assert!(matches!(
            left.select(&Feature::str("b")).unwrap(),
            ValueOrVar::Value(Value::Literal(Literal::Int64(2)))
        ));
    }

    #[test]
    fn partial_extra_feature_cannot_grow_complete() {
        let partial = partial_rec(
            Literal::Nothing,
            vec![
                (Feature::str("a"), ValueOrVar::Value(Complete::int(1).into())),
                (Feature::str("b"), ValueOrVar::Value(Complete::int(2).into())),
            ],
        );
        let complete = complete_rec(Literal::Nothing, vec![(Feature::str("a"), Complete::int(1))]);
        assert!(unify_recs(&partial, &complete).is_err());
    }

    #[test]
    fn unify_suspends_on_unbound_feature() {
        let feature_var = Var::new();
        let partial = RecVal::Partial(Arc::new(PartialRec::new(
            LiteralOrVar::Literal(Literal::Nothing),
            vec![PartialField {
                feature: FeatureOrVar::Var(feature_var.clone()),
                value: ValueOrVar::Value(Complete::int(1).into()),
            }],
        )));
        let complete = complete_rec(Literal::Nothing, vec![(Feature::str("a"), Complete::int(1))]);
        match unify_recs(&partial, &complete) {
            Err(Signal::Wait(barrier)) => assert!(barrier.same_var(&feature_var)),
            other => panic!("expected a wait, got {other:?}"),
        }
        // Binding the feature lets the same unification re-run to success.
        feature_var.bind_value(Literal::str("a").into()).unwrap();
        unify_recs(&partial, &complete).unwrap();
    }

    #[test]
    fn tuple_arity_mismatch_fails() {
        let a = TupleVal::Complete(Arc::new(CompleteTuple::new(
            Literal::Nothing,
            vec![Complete::int(1)],
        )));
        let b = TupleVal::Complete(Arc::new(CompleteTuple::new(
            Literal::Nothing,
            vec![Complete::int(1), Complete::int(2)],
        )));
        assert!(unify_tuples(&a, &b).is_err());
    }
}
