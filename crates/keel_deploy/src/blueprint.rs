//! The declarative description of a deployment: components, the edges
//! between them, and the role grants to configure.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use keel_chain::abi::{self, AbiValue};
use keel_chain::Address;

use crate::error::DeployError;
use crate::roles;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub components: Vec<ComponentDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDecl {
    pub name: String,
    /// Bytecode reference handed to the network client. Defaults to `name`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact: String,
    #[serde(default)]
    pub args: Vec<ArgDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeDecl>,
}

impl ComponentDecl {
    pub fn artifact_ref(&self) -> &str {
        if self.artifact.is_empty() {
            &self.name
        } else {
            &self.artifact
        }
    }
}

/// One typed constructor argument: a literal `value` or a `ref` to another
/// component's address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDecl {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Where an argument's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgSource<'a> {
    Literal(String),
    Ref(&'a str),
}

impl ArgDecl {
    pub fn literal(ty: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            ty: ty.to_string(),
            value: Some(value.into()),
            reference: None,
        }
    }

    pub fn reference(target: &str) -> Self {
        Self {
            ty: "address".to_string(),
            value: None,
            reference: Some(target.to_string()),
        }
    }

    pub fn source(&self) -> Result<ArgSource<'_>, String> {
        match (&self.value, &self.reference) {
            (Some(value), None) => literal_text(value).map(ArgSource::Literal),
            (None, Some(target)) => Ok(ArgSource::Ref(target)),
            (Some(_), Some(_)) => Err("argument has both 'value' and 'ref'".into()),
            (None, None) => Err("argument needs a 'value' or a 'ref'".into()),
        }
    }

    /// The referenced component, if this is a `ref` argument.
    pub fn target(&self) -> Option<&str> {
        match self.source() {
            Ok(ArgSource::Ref(target)) => Some(target),
            _ => None,
        }
    }

    /// Encode a literal argument. `ref` arguments are resolved by the caller.
    pub fn literal_value(&self) -> Result<Option<AbiValue>, String> {
        match self.source()? {
            ArgSource::Literal(raw) => AbiValue::from_literal(&self.ty, &raw)
                .map(Some)
                .map_err(|e| e.to_string()),
            ArgSource::Ref(_) => Ok(None),
        }
    }
}

fn literal_text(value: &serde_json::Value) -> Result<String, String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("unsupported literal {other}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// `from` needs `to`'s address at construction time.
    Constructor,
    /// `from` learns `to`'s address through a setter after both exist.
    Wiring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    /// Full setter signature on `from`, e.g. `setVault(address)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setter: Option<String>,
    /// Zero-argument getter on `from` returning the wired address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub getter: Option<String>,
}

/// One-shot read-only sanity check run by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDecl {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<ArgDecl>,
}

/// Who receives a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Deployer,
    Component(String),
    Address(Address),
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty grant subject".into());
        }
        if s.eq_ignore_ascii_case("deployer") {
            return Ok(Self::Deployer);
        }
        if s.starts_with("0x") || s.starts_with("0X") {
            return s.parse().map(Self::Address).map_err(|e| format!("{e}"));
        }
        Ok(Self::Component(s.to_string()))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployer => f.write_str("deployer"),
            Self::Component(name) => f.write_str(name),
            Self::Address(addr) => write!(f, "{addr}"),
        }
    }
}

impl Serialize for Subject {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub subject: Subject,
    pub role: String,
    /// Component on which the role is granted.
    pub resource: String,
}

impl fmt::Display for RoleGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} to {}", self.role, self.resource, self.subject)
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Blueprint {
    pub fn from_json(json: &str) -> Result<Self, DeployError> {
        let blueprint: Self =
            serde_json::from_str(json).map_err(|e| DeployError::InvalidBlueprint(e.to_string()))?;
        blueprint.validate()?;
        Ok(blueprint)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, DeployError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DeployError::InvalidBlueprint(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json).map_err(|e| match e {
            DeployError::InvalidBlueprint(msg) => {
                DeployError::InvalidBlueprint(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDecl> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn wiring_edges(&self) -> impl Iterator<Item = &EdgeDecl> {
        self.edges.iter().filter(|e| e.kind == EdgeKind::Wiring)
    }

    /// Reject anything that would make planning or execution ambiguous.
    pub fn validate(&self) -> Result<(), DeployError> {
        let invalid = |msg: String| Err(DeployError::InvalidBlueprint(msg));

        if self.components.is_empty() {
            return invalid("blueprint declares no components".into());
        }

        let mut names = HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return invalid("component with an empty name".into());
            }
            if !names.insert(component.name.as_str()) {
                return invalid(format!("duplicate component name '{}'", component.name));
            }
        }

        for component in &self.components {
            for (i, arg) in component.args.iter().enumerate() {
                let ctx = format!("{} argument {i}", component.name);
                abi::canonical_type(&arg.ty).map_err(|e| invalid_at(&ctx, e))?;
                match arg.source().map_err(|e| invalid_at(&ctx, e))? {
                    ArgSource::Literal(_) => {
                        arg.literal_value().map_err(|e| invalid_at(&ctx, e))?;
                    }
                    ArgSource::Ref(target) => {
                        if abi::canonical_type(&arg.ty) != Ok("address") {
                            return invalid(format!("{ctx}: a ref must have type address"));
                        }
                        if target == component.name {
                            return invalid(format!("{ctx}: component references itself"));
                        }
                        if !names.contains(target) {
                            return invalid(format!("{ctx}: unknown component '{target}'"));
                        }
                    }
                }
            }
            if let Some(probe) = &component.probe {
                let ctx = format!("{} probe", component.name);
                let params = abi::param_types(&probe.method).map_err(|e| invalid_at(&ctx, e))?;
                if !params.is_empty() {
                    return invalid(format!("{ctx}: '{}' must take no arguments", probe.method));
                }
                if let Some(expect) = &probe.expect {
                    abi::canonical_type(&expect.ty).map_err(|e| invalid_at(&ctx, e))?;
                    if let Some(target) = expect.target() {
                        if !names.contains(target) {
                            return invalid(format!("{ctx}: unknown component '{target}'"));
                        }
                    } else {
                        expect.literal_value().map_err(|e| invalid_at(&ctx, e))?;
                    }
                }
            }
        }

        let mut wired = HashSet::new();
        for edge in &self.edges {
            let ctx = format!("edge {} -> {}", edge.from, edge.to);
            for end in [&edge.from, &edge.to] {
                if !names.contains(end.as_str()) {
                    return invalid(format!("{ctx}: unknown component '{end}'"));
                }
            }
            if edge.from == edge.to {
                return invalid(format!("{ctx}: self edge"));
            }
            match edge.kind {
                EdgeKind::Constructor => {
                    if edge.setter.is_some() || edge.getter.is_some() {
                        return invalid(format!("{ctx}: constructor edges take no setter/getter"));
                    }
                }
                EdgeKind::Wiring => {
                    let Some(setter) = &edge.setter else {
                        return invalid(format!("{ctx}: wiring edge needs a setter"));
                    };
                    let params = abi::param_types(setter).map_err(|e| invalid_at(&ctx, e))?;
                    if params.len() != 1 || abi::canonical_type(&params[0]) != Ok("address") {
                        return invalid(format!("{ctx}: setter '{setter}' must take one address"));
                    }
                    if let Some(getter) = &edge.getter {
                        let params = abi::param_types(getter).map_err(|e| invalid_at(&ctx, e))?;
                        if !params.is_empty() {
                            return invalid(format!("{ctx}: getter '{getter}' must take no arguments"));
                        }
                    }
                    if !wired.insert((edge.from.as_str(), edge.to.as_str())) {
                        return invalid(format!("{ctx}: duplicate wiring edge"));
                    }
                }
            }
        }

        for grant in &self.roles {
            let ctx = format!("grant {grant}");
            if !names.contains(grant.resource.as_str()) {
                return invalid(format!("{ctx}: unknown resource '{}'", grant.resource));
            }
            if let Subject::Component(name) = &grant.subject {
                if !names.contains(name.as_str()) {
                    return invalid(format!("{ctx}: unknown subject '{name}'"));
                }
            }
            roles::role_id(&grant.role).map_err(|e| invalid_at(&ctx, e))?;
        }

        Ok(())
    }
}

fn invalid_at(ctx: &str, err: impl fmt::Display) -> DeployError {
    DeployError::InvalidBlueprint(format!("{ctx}: {err}"))
}
