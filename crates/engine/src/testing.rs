//! Arithmetic demo metamodel
//!
//! Two external types: `Value` (`{"value": 5}`) and `Operator`
//! (`{"operator": "ADD", "operands": ["A", "B"]}`). Each drives one
//! internal element; an operator element links the `ValueState:calc`
//! elements of its operands and outputs the integer result. An operator
//! with `"publish": "C"` also maintains a slave `Value` named `C`, so
//! operators can be chained.

use crate::engine::Engine;
use crate::phase::{Acceptance, InternalPhase, ProcessRequest, ProcessResult, SlaveChanges};
use crate::registry::TypeRegistry;
use crate::EngineConfig;
use converge_core::error::Result;
use converge_core::{ElementId, MetaModel, MetaModelSpec, ObjectId, ObjectStore, PhaseSpec};
use converge_storage::MemoryStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Namespace object type
pub const NAMESPACE: &str = "Namespace";
/// External value type
pub const VALUE: &str = "Value";
/// External operator type
pub const OPERATOR: &str = "Operator";
/// Internal type behind `Value`
pub const VALUE_STATE: &str = "ValueState";
/// Internal type behind `Operator`
pub const OPERATOR_STATE: &str = "OperatorState";
/// The single phase of both internal types
pub const CALC: &str = "calc";

/// The demo metamodel
pub fn metamodel() -> Result<MetaModel> {
    MetaModel::new(
        "calculator",
        MetaModelSpec::new(NAMESPACE)
            .external_type(VALUE, VALUE_STATE, CALC)
            .external_type(OPERATOR, OPERATOR_STATE, CALC)
            .internal_type(VALUE_STATE, vec![PhaseSpec::new(CALC)])
            .internal_type(
                OPERATOR_STATE,
                vec![PhaseSpec::new(CALC).depends_on(VALUE_STATE, CALC)],
            )
            .with_slave(VALUE),
    )
}

/// Implementations for the demo internal types
pub fn registry() -> Result<TypeRegistry> {
    TypeRegistry::new()
        .with(VALUE_STATE, Arc::new(ValueState))?
        .with(OPERATOR_STATE, Arc::new(OperatorState))
}

/// Demo engine over a fresh [`MemoryStore`], not yet started
pub fn engine(config: EngineConfig) -> Result<Engine> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    Engine::new(config, store, metamodel()?, registry()?)
}

/// `ValueState:calc` element of value `name`
pub fn value_element(namespace: &str, name: &str) -> ElementId {
    ObjectId::new(VALUE_STATE, namespace, name).element(CALC)
}

/// Outputs the spec's integer
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueState;

impl InternalPhase for ValueState {
    fn accept_external_state(&self, _element: &ElementId, spec: &Value) -> Acceptance {
        match spec.get("value").and_then(Value::as_i64) {
            Some(n) => Acceptance::accept(json!({ "value": n })),
            None => Acceptance::Invalid("value must be an integer".into()),
        }
    }

    fn process(&self, request: &ProcessRequest<'_>) -> ProcessResult {
        if request.deleting {
            return ProcessResult::Deleted;
        }
        match request.spec.get("value") {
            Some(v) => ProcessResult::completed(v.clone()),
            None => ProcessResult::Failed("spec has no value".into()),
        }
    }
}

/// Arithmetic over operand values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    /// Sum
    Add,
    /// First minus the rest
    Sub,
    /// Product
    Mul,
    /// First divided by the rest
    Div,
    /// Smallest operand
    Min,
    /// Largest operand
    Max,
}

impl Operator {
    /// Fold the operands; `None` on overflow or division by zero
    pub fn apply(self, operands: &[i64]) -> Option<i64> {
        let (first, rest) = operands.split_first()?;
        rest.iter().try_fold(*first, |acc, &x| match self {
            Operator::Add => acc.checked_add(x),
            Operator::Sub => acc.checked_sub(x),
            Operator::Mul => acc.checked_mul(x),
            Operator::Div => acc.checked_div(x),
            Operator::Min => Some(acc.min(x)),
            Operator::Max => Some(acc.max(x)),
        })
    }
}

/// Accepted form of an `Operator` spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSpec {
    /// Operation
    pub operator: Operator,
    /// Value names, in order
    pub operands: Vec<String>,
    /// Name of a slave `Value` receiving the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<String>,
}

/// Computes an operator over its operand values
#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorState;

impl OperatorState {
    fn published(element: &ElementId, spec: &OperatorSpec) -> Option<ObjectId> {
        spec.publish
            .as_ref()
            .map(|name| ObjectId::new(VALUE, element.namespace(), name.clone()))
    }
}

impl InternalPhase for OperatorState {
    fn accept_external_state(&self, element: &ElementId, spec: &Value) -> Acceptance {
        let parsed: OperatorSpec = match serde_json::from_value(spec.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return Acceptance::Invalid(format!("bad operator spec: {}", e)),
        };
        if parsed.operands.is_empty() {
            return Acceptance::Invalid("operator needs at least one operand".into());
        }
        if parsed.publish.as_deref() == Some(element.object.name.as_str()) {
            return Acceptance::Invalid("operator cannot publish to its own name".into());
        }
        let links = parsed
            .operands
            .iter()
            .map(|name| value_element(element.namespace(), name))
            .collect();
        match serde_json::to_value(&parsed) {
            Ok(spec) => Acceptance::Accept { spec, links },
            Err(e) => Acceptance::Invalid(e.to_string()),
        }
    }

    fn process(&self, request: &ProcessRequest<'_>) -> ProcessResult {
        let spec: Option<OperatorSpec> = serde_json::from_value(request.spec.clone()).ok();
        if request.deleting {
            let mut slaves = SlaveChanges::default();
            if let Some(id) = spec.as_ref().and_then(|s| Self::published(request.element, s)) {
                slaves.delete.push(id);
            }
            return ProcessResult::Completed {
                output: Value::Null,
                slaves,
            };
        }
        let spec = match spec {
            Some(spec) => spec,
            None => return ProcessResult::Failed("spec is not an operator".into()),
        };

        let mut operands = Vec::with_capacity(spec.operands.len());
        for name in &spec.operands {
            let id = value_element(request.element.namespace(), name);
            match request.input(&id).and_then(Value::as_i64) {
                Some(n) => operands.push(n),
                None => return ProcessResult::Waiting(format!("operand {} has no value", name)),
            }
        }
        let result = match spec.operator.apply(&operands) {
            Some(result) => result,
            None => return ProcessResult::Failed(format!("{:?} overflowed or divided by zero", spec.operator)),
        };

        let mut slaves = SlaveChanges::default();
        if let Some(id) = Self::published(request.element, &spec) {
            slaves.apply.push((id, json!({ "value": result })));
        }
        ProcessResult::Completed {
            output: json!(result),
            slaves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::CurrentState;
    use std::collections::BTreeMap;

    fn op_element() -> ElementId {
        ObjectId::new(OPERATOR_STATE, "ns", "x").element(CALC)
    }

    #[test]
    fn test_model_and_registry_agree() {
        let model = metamodel().unwrap();
        registry().unwrap().validate(&model).unwrap();
        assert_eq!(model.slave_types(OPERATOR_STATE), &[VALUE.to_string()]);
    }

    #[test]
    fn test_operator_apply() {
        assert_eq!(Operator::Add.apply(&[5, 6]), Some(11));
        assert_eq!(Operator::Sub.apply(&[10, 3, 2]), Some(5));
        assert_eq!(Operator::Mul.apply(&[2, 3, 4]), Some(24));
        assert_eq!(Operator::Div.apply(&[20, 2]), Some(10));
        assert_eq!(Operator::Div.apply(&[1, 0]), None);
        assert_eq!(Operator::Min.apply(&[3, -1, 2]), Some(-1));
        assert_eq!(Operator::Max.apply(&[3, -1, 2]), Some(3));
        assert_eq!(Operator::Add.apply(&[i64::MAX, 1]), None);
        assert_eq!(Operator::Add.apply(&[]), None);
    }

    #[test]
    fn test_value_accept() {
        let e = value_element("ns", "a");
        assert_eq!(
            ValueState.accept_external_state(&e, &json!({"value": 5, "extra": true})),
            Acceptance::accept(json!({"value": 5}))
        );
        assert!(matches!(
            ValueState.accept_external_state(&e, &json!({"value": "five"})),
            Acceptance::Invalid(_)
        ));
    }

    #[test]
    fn test_operator_accept_links_operands() {
        let spec = json!({"operator": "ADD", "operands": ["a", "b"]});
        match OperatorState.accept_external_state(&op_element(), &spec) {
            Acceptance::Accept { links, .. } => {
                assert_eq!(links, vec![value_element("ns", "a"), value_element("ns", "b")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_operator_accept_invalid() {
        let e = op_element();
        for spec in [
            json!({"operator": "POW", "operands": ["a"]}),
            json!({"operator": "ADD", "operands": []}),
            json!({"operator": "ADD", "operands": ["a"], "publish": "x"}),
            json!(42),
        ] {
            assert!(matches!(
                OperatorState.accept_external_state(&e, &spec),
                Acceptance::Invalid(_)
            ));
        }
    }

    #[test]
    fn test_operator_process_publishes() {
        let element = op_element();
        let spec = json!({"operator": "MUL", "operands": ["a", "b"], "publish": "c"});
        let mut inputs = BTreeMap::new();
        for (name, v) in [("a", 3), ("b", 4)] {
            inputs.insert(
                value_element("ns", name),
                CurrentState {
                    output: Some(json!(v)),
                    ..Default::default()
                },
            );
        }
        let current = CurrentState::default();
        let request = ProcessRequest {
            element: &element,
            spec: &spec,
            inputs: &inputs,
            current: &current,
            formal_version: "fv",
            deleting: false,
        };
        match OperatorState.process(&request) {
            ProcessResult::Completed { output, slaves } => {
                assert_eq!(output, json!(12));
                assert_eq!(
                    slaves.apply,
                    vec![(ObjectId::new(VALUE, "ns", "c"), json!({"value": 12}))]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_operator_delete_removes_published_value() {
        let element = op_element();
        let spec = json!({"operator": "ADD", "operands": ["a"], "publish": "c"});
        let inputs = BTreeMap::new();
        let current = CurrentState::default();
        let request = ProcessRequest {
            element: &element,
            spec: &spec,
            inputs: &inputs,
            current: &current,
            formal_version: "",
            deleting: true,
        };
        match OperatorState.process(&request) {
            ProcessResult::Completed { slaves, .. } => {
                assert_eq!(slaves.delete, vec![ObjectId::new(VALUE, "ns", "c")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_operand_waits() {
        let element = op_element();
        let spec = json!({"operator": "ADD", "operands": ["a"]});
        let inputs = BTreeMap::new();
        let current = CurrentState::default();
        let request = ProcessRequest {
            element: &element,
            spec: &spec,
            inputs: &inputs,
            current: &current,
            formal_version: "",
            deleting: false,
        };
        assert!(matches!(
            OperatorState.process(&request),
            ProcessResult::Waiting(_)
        ));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn reference(op: Operator, operands: &[i64]) -> Option<i64> {
            let (first, rest) = operands.split_first()?;
            let mut acc = *first as i128;
            for &x in rest {
                acc = match op {
                    Operator::Add => acc + x as i128,
                    Operator::Sub => acc - x as i128,
                    Operator::Mul => acc.checked_mul(x as i128)?,
                    Operator::Div if x == 0 => return None,
                    Operator::Div => acc / x as i128,
                    Operator::Min => acc.min(x as i128),
                    Operator::Max => acc.max(x as i128),
                };
                if acc < i64::MIN as i128 || acc > i64::MAX as i128 {
                    return None;
                }
            }
            Some(acc as i64)
        }

        fn operator() -> impl Strategy<Value = Operator> {
            prop_oneof![
                Just(Operator::Add),
                Just(Operator::Sub),
                Just(Operator::Mul),
                Just(Operator::Div),
                Just(Operator::Min),
                Just(Operator::Max),
            ]
        }

        proptest! {
            #[test]
            fn prop_apply_matches_wide_arithmetic(
                op in operator(),
                operands in proptest::collection::vec(any::<i64>(), 0..6),
            ) {
                prop_assert_eq!(op.apply(&operands), reference(op, &operands));
            }

            #[test]
            fn prop_small_operands_never_overflow(
                operands in proptest::collection::vec(-1000i64..1000, 1..5),
            ) {
                prop_assert!(Operator::Add.apply(&operands).is_some());
                prop_assert!(Operator::Mul.apply(&operands).is_some());
            }
        }
    }
}
