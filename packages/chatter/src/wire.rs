//! Message types and the built-in schema modules.
//!
//! The wire envelope (`Hat.Msg`) wraps every transmitted message; its `data`
//! field carries the user payload pre-encoded as bytes, so the envelope can
//! be decoded without knowing the payload type. The `HatChatter` module
//! holds the two internal keep-alive payloads, which are never surfaced to
//! users.

use crate::conv::Conversation;
use anyhow::{
    bail,
    ensure,
    Context,
};
use sbs::{
    schema,
    RecordValueField,
    Repository,
    Schema,
    Value,
};


pub(crate) const HAT_MODULE: &str = "Hat";
pub(crate) const MSG_TYPE: &str = "Msg";
pub(crate) const DATA_TYPE: &str = "Data";

pub(crate) const CHATTER_MODULE: &str = "HatChatter";
pub(crate) const PING_TYPE: &str = "MsgPing";
pub(crate) const PONG_TYPE: &str = "MsgPong";

/// Repository holding the chatter schema modules: `Hat` with the wire
/// envelope, and `HatChatter` with the internal keep-alive payloads. Merge
/// application modules into this repository (or this repository into yours)
/// before connecting or listening; both peers must carry it.
pub fn sbs_repo() -> Repository {
    let mut repo = Repository::new();
    repo.register(HAT_MODULE, MSG_TYPE, schema!(record {
        (id: integer),
        (first: integer),
        (owner: boolean),
        (token: boolean),
        (last: boolean),
        (data: ref(HAT_MODULE, DATA_TYPE)),
    }));
    // `type` is a keyword, so this one skips the schema macro
    repo.register(HAT_MODULE, DATA_TYPE, Schema::Record(vec![
        ("module", Schema::Optional(Box::new(Schema::Str))).into(),
        ("type", Schema::Str).into(),
        ("data", Schema::Bytes).into(),
    ]));
    repo.register(CHATTER_MODULE, PING_TYPE, schema!(record {}));
    repo.register(CHATTER_MODULE, PONG_TYPE, schema!(record {}));
    repo
}

/// User payload carried by a message: a value conformant to `(module, ty)`
/// under the schema repository both peers share. A `module` of `None` names
/// a built-in SBS type.
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub module: Option<String>,
    pub ty: String,
    pub data: Value,
}

impl Data {
    pub fn new<M, T>(module: M, ty: T, data: Value) -> Self
    where
        M: Into<Option<String>>,
        T: Into<String>,
    {
        Data {
            module: module.into(),
            ty: ty.into(),
            data,
        }
    }
}

/// Message delivered by [`Connection::receive`](crate::Connection::receive).
#[derive(Debug)]
pub struct Msg {
    /// Conversation this message belongs to, from the receiving peer's
    /// viewpoint.
    pub conv: Conversation,
    /// Whether this message opened its conversation.
    pub first: bool,
    /// Whether this message ends its conversation.
    pub last: bool,
    /// Turn-taking flag, preserved end-to-end.
    pub token: bool,
    /// The decoded payload.
    pub data: Data,
}

/// The `Hat.Msg` envelope as it travels the wire. Payload still encoded.
#[derive(Debug)]
pub(crate) struct WireMsg {
    pub id: u64,
    pub first: u64,
    pub owner: bool,
    pub token: bool,
    pub last: bool,
    pub data: WireData,
}

#[derive(Debug)]
pub(crate) struct WireData {
    pub module: Option<String>,
    pub ty: String,
    pub data: Vec<u8>,
}

impl WireMsg {
    pub(crate) fn to_value(&self) -> Value {
        let module = match &self.data.module {
            Some(module) => Value::some(Value::Str(module.clone())),
            None => Value::none(),
        };
        Value::Record(vec![
            ("id", Value::Integer(self.id as i64)).into(),
            ("first", Value::Integer(self.first as i64)).into(),
            ("owner", Value::Boolean(self.owner)).into(),
            ("token", Value::Boolean(self.token)).into(),
            ("last", Value::Boolean(self.last)).into(),
            ("data", Value::Record(vec![
                ("module", module).into(),
                ("type", Value::Str(self.data.ty.clone())).into(),
                ("data", Value::Bytes(self.data.data.clone())).into(),
            ])).into(),
        ])
    }

    pub(crate) fn from_value(value: Value) -> anyhow::Result<Self> {
        let mut fields = record_fields(value).context("envelope")?;
        let msg = WireMsg {
            id: take_uint(&mut fields, "id")?,
            first: take_uint(&mut fields, "first")?,
            owner: take_bool(&mut fields, "owner")?,
            token: take_bool(&mut fields, "token")?,
            last: take_bool(&mut fields, "last")?,
            data: {
                let mut fields =
                    record_fields(take(&mut fields, "data")?).context("envelope data")?;
                WireData {
                    module: match take(&mut fields, "module")? {
                        Value::Optional(None) => None,
                        Value::Optional(Some(value)) => match *value {
                            Value::Str(module) => Some(module),
                            _ => bail!("module is not a str"),
                        },
                        _ => bail!("module is not optional"),
                    },
                    ty: match take(&mut fields, "type")? {
                        Value::Str(ty) => ty,
                        _ => bail!("type is not a str"),
                    },
                    data: match take(&mut fields, "data")? {
                        Value::Bytes(data) => data,
                        _ => bail!("data is not bytes"),
                    },
                }
            },
        };
        Ok(msg)
    }
}

type FieldIter = std::vec::IntoIter<RecordValueField>;

fn record_fields(value: Value) -> anyhow::Result<FieldIter> {
    match value {
        Value::Record(fields) => Ok(fields.into_iter()),
        _ => bail!("not a record"),
    }
}

fn take(fields: &mut FieldIter, name: &str) -> anyhow::Result<Value> {
    let field = fields
        .next()
        .with_context(|| format!("field {:?} missing", name))?;
    ensure!(
        field.name == name,
        "field {:?} where {:?} expected",
        field.name,
        name,
    );
    Ok(field.value)
}

fn take_uint(fields: &mut FieldIter, name: &str) -> anyhow::Result<u64> {
    match take(fields, name)? {
        Value::Integer(n) => {
            u64::try_from(n).with_context(|| format!("{} {} is negative", name, n))
        }
        _ => bail!("{} is not an integer", name),
    }
}

fn take_bool(fields: &mut FieldIter, name: &str) -> anyhow::Result<bool> {
    match take(fields, name)? {
        Value::Boolean(b) => Ok(b),
        _ => bail!("{} is not a boolean", name),
    }
}
