//! Attribute resolution: change application, hierarchy assembly and the
//! derivation of zone parameters and zone configuration.
//!
//! Everything here is pure; the model fetches the objects and hands them in.

use sapi_core::{Application, Attributes, ChangeAction, Instance, Manifest, Service, ServiceType};
use serde::Serialize;
use serde_json::{Map, Value};

/// Fields that changes operate on. Anything else in a change is ignored,
/// except for the `set` action which replaces whole objects.
pub const MANAGED_FIELDS: [&str; 4] = ["params", "metadata", "manifests", "metadata_schema"];

/// Provisioning brand forced onto every VM.
pub const ZONE_BRAND: &str = "joyent-minimal";

/// Metadata key holding the user script; never exposed through zone config.
pub const USER_SCRIPT_KEY: &str = "user-script";

/// Metadata key holding the script run on a VM's compute node before the
/// VM is destroyed.
pub const TEARDOWN_SCRIPT_KEY: &str = "pre_teardown_script";

/// Identifiers copied into composed metadata for consumers that predate
/// the instance/service split. Customer metadata only carries them when
/// `pass_vmapi_metadata_keys` names them.
const LEGACY_SERVICE_NAME: &str = "SERVICE_NAME";
const LEGACY_SERVICE_UUID: &str = "SERVICE_UUID";

/// Apply `change` to `obj` and return the resulting object.
pub fn apply_change(obj: &Attributes, change: &Attributes, action: ChangeAction) -> Attributes {
    if action == ChangeAction::Set {
        let mut result = change.clone();
        for (k, v) in obj {
            result.entry(k.clone()).or_insert_with(|| v.clone());
        }
        return result;
    }

    let mut result = obj.clone();
    for field in MANAGED_FIELDS {
        let Some(delta) = change.get(field) else {
            continue;
        };
        match action {
            ChangeAction::Update => match (result.get_mut(field), delta) {
                (Some(Value::Object(target)), Value::Object(entries)) => {
                    for (k, v) in entries {
                        target.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    result.insert(field.to_string(), delta.clone());
                }
            },
            ChangeAction::Replace => {
                result.insert(field.to_string(), delta.clone());
            }
            ChangeAction::Delete => {
                if let Some(Value::Object(target)) = result.get_mut(field) {
                    for key in delete_keys(delta) {
                        target.remove(key);
                    }
                }
            }
            ChangeAction::Set => unreachable!("handled above"),
        }
    }
    result
}

/// Keys named by a delete change: either the keys of an object or the
/// strings of an array.
fn delete_keys(delta: &Value) -> Vec<&str> {
    match delta {
        Value::Object(m) => m.keys().map(String::as_str).collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        Value::String(s) => vec![s.as_str()],
        _ => Vec::new(),
    }
}

/// Layered attribute of the application → service → instance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Params,
    Metadata,
    Manifests,
}

/// Merge `field` from the three levels; deeper levels win per key.
pub fn assemble(app: &Application, svc: &Service, inst: &Instance, field: Field) -> Attributes {
    let mut out = Map::new();
    match field {
        Field::Params => {
            for layer in [&app.params, &svc.params, &inst.params].into_iter().flatten() {
                merge_into(&mut out, layer);
            }
        }
        Field::Metadata => {
            for layer in [&app.metadata, &svc.metadata, &inst.metadata]
                .into_iter()
                .flatten()
            {
                merge_into(&mut out, layer);
            }
        }
        Field::Manifests => {
            for layer in [&app.manifests, &svc.manifests, &inst.manifests]
                .into_iter()
                .flatten()
            {
                for (name, uuid) in layer {
                    out.insert(name.clone(), Value::String(uuid.clone()));
                }
            }
        }
    }
    out
}

fn merge_into(out: &mut Attributes, layer: &Attributes) {
    for (k, v) in layer {
        out.insert(k.clone(), v.clone());
    }
}

/// The three objects an instance's attributes derive from.
#[derive(Debug, Clone)]
pub struct InstanceChain {
    pub application: Application,
    pub service: Service,
    pub instance: Instance,
}

impl InstanceChain {
    pub fn assemble(&self, field: Field) -> Attributes {
        assemble(&self.application, &self.service, &self.instance, field)
    }

    /// Assembled metadata plus the legacy service identifiers.
    pub fn metadata(&self) -> Attributes {
        let mut metadata = self.assemble(Field::Metadata);
        metadata
            .entry(LEGACY_SERVICE_NAME)
            .or_insert_with(|| Value::String(self.service.name.clone()));
        metadata
            .entry(LEGACY_SERVICE_UUID)
            .or_insert_with(|| Value::String(self.service.uuid.clone()));
        metadata
    }

    /// Manifest uuids referenced anywhere in the hierarchy, deeper wins.
    pub fn manifest_uuids(&self) -> Vec<String> {
        self.assemble(Field::Manifests)
            .into_values()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

/// Keys always forwarded into VM customer metadata.
pub const FORWARDED_METADATA_KEYS: [&str; 6] = [
    "SAPI_URL",
    "sapi_url",
    "SAPI-URL",
    "sapi-url",
    USER_SCRIPT_KEY,
    "assets-ip",
];

/// Metadata array naming extra keys to forward into VM customer metadata.
pub const PASS_METADATA_KEYS: &str = "pass_vmapi_metadata_keys";

/// Reduce metadata to what the VM platform needs. The config agent in the
/// zone reads everything else from the registry directly.
pub fn sanitize_metadata(metadata: &Attributes) -> Attributes {
    let extra: Vec<&str> = match metadata.get(PASS_METADATA_KEYS) {
        Some(Value::Array(keys)) => keys.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    metadata
        .iter()
        .filter(|(k, _)| {
            FORWARDED_METADATA_KEYS.contains(&k.as_str()) || extra.contains(&k.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Provisioning parameters for the instance's VM. Agents have no VM and
/// get an empty set.
pub fn zone_params(chain: &InstanceChain) -> Attributes {
    if chain.instance.kind == ServiceType::Agent {
        return Map::new();
    }

    let mut params = chain.assemble(Field::Params);
    params.insert(
        "owner_uuid".to_string(),
        Value::String(chain.application.owner_uuid.clone()),
    );
    params.insert("uuid".to_string(), Value::String(chain.instance.uuid.clone()));
    params.insert("brand".to_string(), Value::String(ZONE_BRAND.to_string()));
    params.insert(
        "customer_metadata".to_string(),
        Value::Object(sanitize_metadata(&chain.metadata())),
    );

    if let Some(networks) = params.get("networks").cloned() {
        params.insert("networks".to_string(), normalize_networks(&networks));
    }
    params
}

/// Network references given by uuid become `{uuid}` objects; names and
/// explicit objects pass through.
fn normalize_networks(networks: &Value) -> Value {
    let Value::Array(items) = networks else {
        return networks.clone();
    };
    Value::Array(
        items
            .iter()
            .map(|item| match item {
                Value::String(s) if uuid::Uuid::parse_str(s).is_ok() => {
                    serde_json::json!({ "uuid": s })
                }
                Value::String(s) => serde_json::json!({ "name": s }),
                other => other.clone(),
            })
            .collect(),
    )
}

/// Configuration consumed by the agent inside a zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneConfig {
    pub instance: String,
    pub metadata: Attributes,
    pub manifests: Vec<Manifest>,
}

/// Combine composed metadata with the resolved manifest objects.
pub fn zone_config(chain: &InstanceChain, mut manifests: Vec<Manifest>) -> ZoneConfig {
    let mut metadata = chain.metadata();
    metadata.remove(USER_SCRIPT_KEY);
    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    ZoneConfig {
        instance: chain.instance.uuid.clone(),
        metadata,
        manifests,
    }
}

/// Structural checks that need no store access. Returns the reason for the
/// first violation.
pub fn check_shape(obj: &Attributes) -> Result<(), String> {
    if obj.contains_key("application_uuid") {
        match obj.get("type") {
            None => {}
            Some(Value::String(t)) if t == "vm" || t == "agent" => {}
            Some(other) => return Err(format!("unsupported service type {other}")),
        }
    }
    for field in ["params", "metadata", "manifests"] {
        match obj.get(field) {
            None | Some(Value::Object(_)) | Some(Value::Null) => {}
            Some(_) => return Err(format!("{field} must be an object")),
        }
    }
    if let Some(Value::Object(manifests)) = obj.get("manifests") {
        if let Some((name, _)) = manifests.iter().find(|(_, v)| !v.is_string()) {
            return Err(format!("manifest reference {name} must be a uuid string"));
        }
    }
    Ok(())
}

/// Manifest uuids referenced by an object's `manifests` field.
pub fn referenced_manifests(obj: &Attributes) -> Vec<String> {
    match obj.get("manifests") {
        Some(Value::Object(m)) => m
            .values()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
