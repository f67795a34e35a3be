//! Registry of named schemas and the encode/decode entry points.

use crate::{
    error::{
        bail,
        ensure,
        error,
        Result,
    },
    schema::Schema,
    value::Value,
};
use std::collections::HashMap;


/// Collection of schemas keyed by `(module, name)`. A `module` of `None`
/// holds the built-in types, which every repository starts with.
#[derive(Debug, Clone)]
pub struct Repository {
    types: HashMap<(Option<String>, String), Schema>,
}

impl Default for Repository {
    fn default() -> Self {
        Repository::new()
    }
}

impl Repository {
    /// Construct with the built-in types registered: `Integer`, `Boolean`,
    /// `String`, `Bytes`.
    pub fn new() -> Self {
        let mut repo = Repository {
            types: HashMap::new(),
        };
        for (name, schema) in [
            ("Integer", Schema::Integer),
            ("Boolean", Schema::Boolean),
            ("String", Schema::Str),
            ("Bytes", Schema::Bytes),
        ] {
            repo.types.insert((None, name.to_owned()), schema);
        }
        repo
    }

    /// Register a type, replacing any previous registration under the same
    /// `(module, name)`.
    pub fn register<M, N>(&mut self, module: M, name: N, schema: Schema)
    where
        M: Into<String>,
        N: Into<String>,
    {
        self.types.insert((Some(module.into()), name.into()), schema);
    }

    /// Copy all of another repository's types into this one. Later merges
    /// win on collision.
    pub fn merge(&mut self, other: &Repository) {
        for (key, schema) in &other.types {
            self.types.insert(key.clone(), schema.clone());
        }
    }

    /// Encode `value` against the schema registered under `(module, name)`.
    pub fn encode(
        &self,
        module: Option<&str>,
        name: &str,
        value: &Value,
    ) -> Result<Vec<u8>> {
        let schema = self.resolve(module, name)?;
        let mut buf = Vec::new();
        value.encode_to(schema, self, 0, &mut buf)?;
        Ok(buf)
    }

    /// Decode one value of the type registered under `(module, name)` from
    /// `bytes`. Trailing bytes after the value are an error.
    pub fn decode(
        &self,
        module: Option<&str>,
        name: &str,
        bytes: &[u8],
    ) -> Result<Value> {
        let schema = self.resolve(module, name)?;
        let mut read = bytes;
        let value = Value::decode_from(schema, self, 0, &mut read)?;
        ensure!(
            read.is_empty(),
            MalformedData,
            "{} extra bytes after end of value",
            read.len(),
        );
        Ok(value)
    }

    pub(crate) fn resolve(&self, module: Option<&str>, name: &str) -> Result<&Schema> {
        let key = (module.map(str::to_owned), name.to_owned());
        self.types
            .get(&key)
            .ok_or_else(|| error!(
                UnknownType,
                "no type {:?} in module {:?}",
                name,
                module,
            ))
    }
}
