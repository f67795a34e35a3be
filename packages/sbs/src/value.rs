//! Dynamic representation of data within the serialized data model, analogous
//! to `serde_json::Value`.

use crate::{
    error::{
        bail,
        ensure,
        error,
        Result,
    },
    repo::Repository,
    schema::Schema,
    var_len::{
        read_var_len_sint,
        read_var_len_uint,
        write_var_len_sint,
        write_var_len_uint,
    },
};
use std::io::{
    Read,
    Write,
};


/// How many type references a single encode/decode may chase before the
/// repository declares a reference cycle.
pub(crate) const MAX_REF_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Str(String),
    Bytes(Vec<u8>),
    Optional(Option<Box<Value>>),
    List(Vec<Value>),
    Record(Vec<RecordValueField>),
    Union {
        name: String,
        value: Box<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordValueField {
    pub name: String,
    pub value: Value,
}

impl<S: Into<String>> From<(S, Value)> for RecordValueField {
    fn from((name, value): (S, Value)) -> Self {
        RecordValueField {
            name: name.into(),
            value,
        }
    }
}

impl Value {
    /// Optional holding a value.
    pub fn some(value: Value) -> Self {
        Value::Optional(Some(Box::new(value)))
    }

    /// Optional holding nothing.
    pub fn none() -> Self {
        Value::Optional(None)
    }

    /// Tagged union variant.
    pub fn union<S: Into<String>>(name: S, value: Value) -> Self {
        Value::Union {
            name: name.into(),
            value: Box::new(value),
        }
    }

    fn display_str(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Optional(_) => "optional",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Union { .. } => "union",
        }
    }

    pub(crate) fn encode_to<W: Write>(
        &self,
        schema: &Schema,
        repo: &Repository,
        depth: usize,
        write: &mut W,
    ) -> Result<()> {
        match (schema, self) {
            (&Schema::Integer, &Value::Integer(n)) => write_var_len_sint(write, n),
            (&Schema::Boolean, &Value::Boolean(b)) => {
                write.write_all(&[b as u8])?;
                Ok(())
            }
            (&Schema::Str, &Value::Str(ref s)) => {
                write_var_len_uint(write, s.len() as u64)?;
                write.write_all(s.as_bytes())?;
                Ok(())
            }
            (&Schema::Bytes, &Value::Bytes(ref b)) => {
                write_var_len_uint(write, b.len() as u64)?;
                write.write_all(b)?;
                Ok(())
            }
            (&Schema::Optional(_), &Value::Optional(None)) => {
                write.write_all(&[0])?;
                Ok(())
            }
            (&Schema::Optional(ref inner), &Value::Optional(Some(ref value))) => {
                write.write_all(&[1])?;
                value.encode_to(inner, repo, depth, write)
            }
            (&Schema::List(ref inner), &Value::List(ref elems)) => {
                write_var_len_uint(write, elems.len() as u64)?;
                for elem in elems {
                    elem.encode_to(inner, repo, depth, write)?;
                }
                Ok(())
            }
            (&Schema::Record(ref schema_fields), &Value::Record(ref fields)) => {
                ensure!(
                    schema_fields.len() == fields.len(),
                    SchemaNonConformance,
                    "record has {} fields, schema wants {}",
                    fields.len(),
                    schema_fields.len(),
                );
                for (schema_field, field) in schema_fields.iter().zip(fields) {
                    ensure!(
                        schema_field.name == field.name,
                        SchemaNonConformance,
                        "record field {:?} where schema wants {:?}",
                        field.name,
                        schema_field.name,
                    );
                    field.value.encode_to(&schema_field.schema, repo, depth, write)?;
                }
                Ok(())
            }
            (&Schema::Union(ref variants), &Value::Union { ref name, ref value }) => {
                let (ord, variant) = variants
                    .iter()
                    .enumerate()
                    .find(|(_, variant)| &variant.name == name)
                    .ok_or_else(|| error!(
                        SchemaNonConformance,
                        "union variant {:?} not in schema",
                        name,
                    ))?;
                write_var_len_uint(write, ord as u64)?;
                value.encode_to(&variant.schema, repo, depth, write)
            }
            (&Schema::Ref { ref module, ref name }, _) => {
                ensure!(
                    depth < MAX_REF_DEPTH,
                    DepthLimit,
                    "reference chain through {:?} too deep",
                    name,
                );
                let schema = repo.resolve(module.as_deref(), name)?;
                self.encode_to(schema, repo, depth + 1, write)
            }
            (schema, value) => bail!(
                SchemaNonConformance,
                "cannot encode {} value as {}",
                value.display_str(),
                schema.display_str(),
            ),
        }
    }

    pub(crate) fn decode_from<R: Read>(
        schema: &Schema,
        repo: &Repository,
        depth: usize,
        read: &mut R,
    ) -> Result<Self> {
        Ok(match schema {
            &Schema::Integer => Value::Integer(read_var_len_sint(read)?),
            &Schema::Boolean => match read_byte(read)? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                b => bail!(MalformedData, "invalid boolean byte {}", b),
            },
            &Schema::Str => {
                let buf = read_len_prefixed(read)?;
                let s = String::from_utf8(buf)
                    .map_err(|e| error!(MalformedData, "invalid utf8 in str: {}", e))?;
                Value::Str(s)
            }
            &Schema::Bytes => Value::Bytes(read_len_prefixed(read)?),
            &Schema::Optional(ref inner) => match read_byte(read)? {
                0 => Value::Optional(None),
                1 => Value::some(Value::decode_from(inner, repo, depth, read)?),
                b => bail!(MalformedData, "invalid optional byte {}", b),
            },
            &Schema::List(ref inner) => {
                let len = read_len(read)?;
                let mut elems = Vec::new();
                for _ in 0..len {
                    elems.push(Value::decode_from(inner, repo, depth, read)?);
                }
                Value::List(elems)
            }
            &Schema::Record(ref schema_fields) => {
                let mut fields = Vec::with_capacity(schema_fields.len());
                for schema_field in schema_fields {
                    fields.push(RecordValueField {
                        name: schema_field.name.clone(),
                        value: Value::decode_from(&schema_field.schema, repo, depth, read)?,
                    });
                }
                Value::Record(fields)
            }
            &Schema::Union(ref variants) => {
                let ord = read_var_len_uint(read)?;
                let variant = usize::try_from(ord)
                    .ok()
                    .and_then(|ord| variants.get(ord))
                    .ok_or_else(|| error!(
                        MalformedData,
                        "union ordinal {} out of range 0..{}",
                        ord,
                        variants.len(),
                    ))?;
                Value::Union {
                    name: variant.name.clone(),
                    value: Box::new(Value::decode_from(&variant.schema, repo, depth, read)?),
                }
            }
            &Schema::Ref { ref module, ref name } => {
                ensure!(
                    depth < MAX_REF_DEPTH,
                    DepthLimit,
                    "reference chain through {:?} too deep",
                    name,
                );
                let schema = repo.resolve(module.as_deref(), name)?;
                Value::decode_from(schema, repo, depth + 1, read)?
            }
        })
    }
}

fn read_byte<R: Read>(read: &mut R) -> Result<u8> {
    let mut buf = [0];
    read.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_len<R: Read>(read: &mut R) -> Result<usize> {
    let len = read_var_len_uint(read)?;
    usize::try_from(len)
        .map_err(|_| error!(MalformedData, "length prefix {} too large", len))
}

// read through `take` so a lying length prefix hits EOF instead of triggering
// a giant up-front allocation
fn read_len_prefixed<R: Read>(read: &mut R) -> Result<Vec<u8>> {
    let len = read_len(read)?;
    let mut buf = Vec::new();
    read.take(len as u64).read_to_end(&mut buf)?;
    ensure!(
        buf.len() == len,
        MalformedData,
        "eof inside length-prefixed data",
    );
    Ok(buf)
}
