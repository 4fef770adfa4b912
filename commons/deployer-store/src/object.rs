use std::collections::BTreeMap;

use kube::ResourceExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};

use crate::error::StoreError;
use crate::traits::StoreResult;

/// Split an apiVersion into (group, version). Core types have an empty group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

pub fn gvk_from_parts(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = split_api_version(api_version);
    GroupVersionKind::gvk(group, version, kind)
}

/// Read the group/version/kind carried in the object's type meta.
pub fn gvk_of(obj: &DynamicObject) -> StoreResult<GroupVersionKind> {
    match obj.types.as_ref() {
        Some(TypeMeta { api_version, kind })
            if !api_version.is_empty() && !kind.is_empty() =>
        {
            Ok(gvk_from_parts(api_version, kind))
        }
        _ => Err(StoreError::UnknownKind(format!(
            "object {} carries no apiVersion/kind",
            obj.name_any()
        ))),
    }
}

/// Build an object skeleton that only carries identity, suitable for get/delete calls.
pub fn object_ref(
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> DynamicObject {
    let ar = ApiResource::from_gvk(gvk);
    let obj = DynamicObject::new(name, &ar);
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => obj.within(ns),
        None => obj,
    }
}

/// Human readable identity used in log fields and error contexts.
pub fn describe(obj: &DynamicObject) -> String {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or("<unknown>");
    match obj.namespace() {
        Some(ns) => format!("{} {}/{}", kind, ns, obj.name_any()),
        None => format!("{} {}", kind, obj.name_any()),
    }
}

/// Render a label map as a `k=v,k2=v2` selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
