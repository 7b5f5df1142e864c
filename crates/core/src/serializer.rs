//! Durable encoding of invocations and result predicates.
//!
//! Every blob carries a schema tag next to its bytes. The bundled
//! [`JsonSerializer`] writes a versioned JSON envelope and only accepts
//! composite argument types that were registered in its [`TypeRegistry`], so
//! decoding is deterministic and never reaches for arbitrary types.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RetryError;
use crate::invocation::Invocation;
use crate::predicate::ResultPredicate;
use crate::value::{ArgValue, CompositeArg};

/// Schema tag written by [`JsonSerializer`] for invocations.
pub const INVOCATION_SCHEMA: &str = "persevere.invocation/json-v1";
/// Schema tag written by [`JsonSerializer`] for predicates.
pub const PREDICATE_SCHEMA: &str = "persevere.predicate/json-v1";

const ENVELOPE_FORMAT: u32 = 1;

/// Bytes plus the schema tag needed to read them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBlob {
    pub schema: String,
    pub bytes: Vec<u8>,
}

impl EncodedBlob {
    pub fn new(schema: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            schema: schema.into(),
            bytes,
        }
    }
}

/// Converts invocations to and from durable bytes.
pub trait InvocationSerializer: Send + Sync {
    fn encode(&self, invocation: &Invocation) -> Result<EncodedBlob, RetryError>;

    fn decode(&self, blob: &EncodedBlob) -> Result<Invocation, RetryError>;
}

/// Converts result predicates to and from durable bytes.
pub trait PredicateSerializer: Send + Sync {
    fn encode(&self, predicate: &ResultPredicate) -> Result<EncodedBlob, RetryError>;

    fn decode(&self, blob: &EncodedBlob) -> Result<ResultPredicate, RetryError>;
}

/// Composite type tags the serializer is allowed to handle, with the newest
/// payload version understood for each.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, u32>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: CompositeArg>(&mut self) -> &mut Self {
        self.register_tag(T::TYPE_TAG, T::VERSION)
    }

    pub fn register_tag(&mut self, tag: impl Into<String>, version: u32) -> &mut Self {
        let entry = self.types.entry(tag.into()).or_insert(version);
        *entry = (*entry).max(version);
        self
    }

    pub fn with<T: CompositeArg>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Check that `tag`@`version` can be read.
    pub fn resolve(&self, tag: &str, version: u32) -> Result<(), RetryError> {
        match self.types.get(tag) {
            None => Err(RetryError::serialization(format!(
                "unregistered composite type: {tag}"
            ))),
            Some(known) if version > *known => Err(RetryError::serialization(format!(
                "composite type {tag} version {version} is newer than supported {known}"
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format: u32,
    body: T,
}

/// JSON serializer with a versioned, schema-tagged envelope.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    types: TypeRegistry,
}

impl JsonSerializer {
    pub fn new(types: TypeRegistry) -> Self {
        Self { types }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    fn check_values(&self, args: &[ArgValue]) -> Result<(), RetryError> {
        let mut result = Ok(());
        for arg in args {
            arg.walk(&mut |v: &ArgValue| {
                if result.is_err() {
                    return;
                }
                result = match v {
                    ArgValue::Float(f) if !f.is_finite() => Err(RetryError::serialization(
                        format!("non-finite float is not representable: {f}"),
                    )),
                    ArgValue::Composite(c) => self.types.resolve(&c.type_tag, c.version),
                    _ => Ok(()),
                };
            });
        }
        result
    }

    fn check_predicate(&self, predicate: &ResultPredicate) -> Result<(), RetryError> {
        match predicate {
            ResultPredicate::ResultEquals { value } => self.check_values(std::slice::from_ref(value)),
            ResultPredicate::Not { inner } => self.check_predicate(inner),
            ResultPredicate::All { of } | ResultPredicate::Any { of } => {
                of.iter().try_for_each(|p| self.check_predicate(p))
            }
            _ => Ok(()),
        }
    }
}

fn write_envelope<T: Serialize>(schema: &str, body: &T) -> Result<EncodedBlob, RetryError> {
    let bytes = serde_json::to_vec(&Envelope {
        format: ENVELOPE_FORMAT,
        body,
    })
    .map_err(|e| RetryError::serialization(format!("encode {schema}: {e}")))?;
    Ok(EncodedBlob::new(schema, bytes))
}

fn read_envelope<T: DeserializeOwned>(schema: &str, blob: &EncodedBlob) -> Result<T, RetryError> {
    if blob.schema != schema {
        return Err(RetryError::serialization(format!(
            "schema mismatch: expected {schema}, found {}",
            blob.schema
        )));
    }
    let envelope: Envelope<T> = serde_json::from_slice(&blob.bytes)
        .map_err(|e| RetryError::serialization(format!("decode {schema}: {e}")))?;
    if envelope.format > ENVELOPE_FORMAT {
        return Err(RetryError::serialization(format!(
            "envelope format {} is newer than supported {ENVELOPE_FORMAT}",
            envelope.format
        )));
    }
    Ok(envelope.body)
}

impl InvocationSerializer for JsonSerializer {
    fn encode(&self, invocation: &Invocation) -> Result<EncodedBlob, RetryError> {
        self.check_values(invocation.args())?;
        write_envelope(INVOCATION_SCHEMA, invocation)
    }

    fn decode(&self, blob: &EncodedBlob) -> Result<Invocation, RetryError> {
        let raw: Invocation = read_envelope(INVOCATION_SCHEMA, blob)?;
        self.check_values(raw.args())?;
        // Re-run capture validation: the bytes may not come from `encode`.
        Invocation::new(raw.target(), raw.method().clone(), raw.args().to_vec())
            .map_err(|e| RetryError::serialization(e.to_string()))
    }
}

impl PredicateSerializer for JsonSerializer {
    fn encode(&self, predicate: &ResultPredicate) -> Result<EncodedBlob, RetryError> {
        self.check_predicate(predicate)?;
        write_envelope(PREDICATE_SCHEMA, predicate)
    }

    fn decode(&self, blob: &EncodedBlob) -> Result<ResultPredicate, RetryError> {
        let predicate: ResultPredicate = read_envelope(PREDICATE_SCHEMA, blob)?;
        self.check_predicate(&predicate)?;
        Ok(predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::MethodId;
    use crate::value::{CompositeValue, ParamType};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        lines: u32,
    }

    impl CompositeArg for Order {
        const TYPE_TAG: &'static str = "shop.order";
        const VERSION: u32 = 2;
    }

    fn serializer() -> JsonSerializer {
        JsonSerializer::new(TypeRegistry::new().with::<Order>())
    }

    fn sample() -> Invocation {
        let order = ArgValue::composite(&Order {
            id: "o-1".into(),
            lines: 3,
        })
        .unwrap();
        Invocation::new(
            "orders",
            MethodId::new(
                "sync",
                [
                    ParamType::composite::<Order>(),
                    ParamType::list(ParamType::Bytes),
                    ParamType::optional(ParamType::Float),
                ],
            ),
            vec![
                order,
                ArgValue::List(vec![vec![0u8, 255].into()]),
                ArgValue::Float(0.25),
            ],
        )
        .unwrap()
    }

    #[test]
    fn invocation_round_trips() {
        let s = serializer();
        let blob = InvocationSerializer::encode(&s, &sample()).unwrap();
        assert_eq!(blob.schema, INVOCATION_SCHEMA);
        let back = InvocationSerializer::decode(&s, &blob).unwrap();
        assert_eq!(back, sample());
        let order: Order = back.args()[0].to_composite().unwrap();
        assert_eq!(order.lines, 3);
    }

    #[test]
    fn unregistered_composite_fails_to_encode_and_decode() {
        let plain = JsonSerializer::default();
        assert!(matches!(
            InvocationSerializer::encode(&plain, &sample()),
            Err(RetryError::Serialization(_))
        ));

        let blob = InvocationSerializer::encode(&serializer(), &sample()).unwrap();
        assert!(matches!(
            InvocationSerializer::decode(&plain, &blob),
            Err(RetryError::Serialization(_))
        ));
    }

    #[test]
    fn newer_composite_version_is_rejected() {
        let s = JsonSerializer::new(TypeRegistry::new().with::<Order>());
        let inv = Invocation::new(
            "orders",
            MethodId::new("sync", [ParamType::Composite("shop.order".into())]),
            vec![ArgValue::Composite(CompositeValue {
                type_tag: "shop.order".into(),
                version: 3,
                payload: serde_json::json!({}),
            })],
        )
        .unwrap();
        assert!(InvocationSerializer::encode(&s, &inv).is_err());
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let inv = Invocation::new(
            "m",
            MethodId::new("f", [ParamType::Float]),
            vec![ArgValue::Float(f64::NAN)],
        )
        .unwrap();
        assert!(InvocationSerializer::encode(&serializer(), &inv).is_err());
    }

    #[test]
    fn malformed_bytes_and_wrong_schema_fail() {
        let s = serializer();
        let garbage = EncodedBlob::new(INVOCATION_SCHEMA, b"{not json".to_vec());
        assert!(InvocationSerializer::decode(&s, &garbage).is_err());

        let blob = InvocationSerializer::encode(&s, &sample()).unwrap();
        let retagged = EncodedBlob::new("other/v9", blob.bytes);
        assert!(InvocationSerializer::decode(&s, &retagged).is_err());
    }

    #[test]
    fn newer_envelope_format_fails() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "format": 99,
            "body": {"op": "no_error"}
        }))
        .unwrap();
        let blob = EncodedBlob::new(PREDICATE_SCHEMA, bytes);
        assert!(PredicateSerializer::decode(&serializer(), &blob).is_err());
    }

    #[test]
    fn tampered_arguments_fail_decode() {
        let s = serializer();
        let bytes = serde_json::to_vec(&serde_json::json!({
            "format": 1,
            "body": {
                "target": "m",
                "method": {"name": "f", "params": [{"kind": "int"}]},
                "args": [{"type": "str", "value": "nope"}]
            }
        }))
        .unwrap();
        let blob = EncodedBlob::new(INVOCATION_SCHEMA, bytes);
        assert!(matches!(
            InvocationSerializer::decode(&s, &blob),
            Err(RetryError::Serialization(_))
        ));
    }

    #[test]
    fn predicate_round_trips() {
        let s = serializer();
        let p = ResultPredicate::All {
            of: vec![
                ResultPredicate::no_error_or_kinds(["gone"]),
                ResultPredicate::named("custom").negate(),
                ResultPredicate::ResultEquals { value: 7i64.into() },
            ],
        };
        let blob = PredicateSerializer::encode(&s, &p).unwrap();
        assert_eq!(blob.schema, PREDICATE_SCHEMA);
        assert_eq!(PredicateSerializer::decode(&s, &blob).unwrap(), p);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn typed_arg() -> impl Strategy<Value = (ParamType, ArgValue)> {
            let leaf = prop_oneof![
                Just((ParamType::optional(ParamType::Int), ArgValue::Null)),
                any::<bool>().prop_map(|b| (ParamType::Bool, ArgValue::Bool(b))),
                any::<i64>().prop_map(|i| (ParamType::Int, ArgValue::Int(i))),
                (-1.0e12f64..1.0e12).prop_map(|f| (ParamType::Float, ArgValue::Float(f))),
                ".{0,24}".prop_map(|s| (ParamType::Str, ArgValue::Str(s))),
                proptest::collection::vec(any::<u8>(), 0..16)
                    .prop_map(|b| (ParamType::Bytes, ArgValue::Bytes(b))),
                ("[a-z]{1,8}", 0u32..1000).prop_map(|(id, lines)| {
                    (
                        ParamType::composite::<Order>(),
                        ArgValue::composite(&Order { id, lines }).unwrap(),
                    )
                }),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                (inner, 0usize..4).prop_map(|((param, value), n)| {
                    (ParamType::list(param), ArgValue::List(vec![value; n]))
                })
            })
        }

        proptest! {
            /// Property: decode(encode(invocation)) reproduces the arguments.
            #[test]
            fn invocation_round_trip_law(typed in proptest::collection::vec(typed_arg(), 0..5)) {
                let (params, args): (Vec<ParamType>, Vec<ArgValue>) = typed.into_iter().unzip();
                let s = serializer();
                let inv = Invocation::new("target", MethodId::new("m", params), args).unwrap();
                let blob = InvocationSerializer::encode(&s, &inv).unwrap();
                let back = InvocationSerializer::decode(&s, &blob).unwrap();
                prop_assert_eq!(back, inv);
            }
        }
    }
}
