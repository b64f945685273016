//! Identities of watch targets and watched objects.

use std::fmt;

use k8s_openapi::{
    api::core::v1::Namespace,
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    Resource as _,
};
use kube_core::{DynamicObject, ResourceExt};

/// A resource type independent of its version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKind {
    /// The API group, or empty string for the core group.
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// One resource type to watch, optionally restricted to a namespace.
///
/// An empty namespace watches all namespaces, or the cluster scope for
/// cluster-scoped resources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

impl Target {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }

    /// The namespace to scope the watch to, if any.
    pub fn scoped_namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/namespaces/{}",
            self.group, self.kind, self.namespace
        )
    }
}

/// Uniquely identifies an object in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub group: String,
    pub kind: String,
    /// The object namespace, or empty string for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Self {
        let (group, kind) = match &obj.types {
            Some(types) => (api_group(&types.api_version), types.kind.clone()),
            None => (String::new(), String::new()),
        };
        Self {
            group,
            kind,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.namespace, self.name, self.group, self.kind
        )
    }
}

/// Splits the group out of an `apiVersion` string.
fn api_group(api_version: &str) -> String {
    match api_version.split_once('/') {
        Some((group, _version)) => group.to_string(),
        None => String::new(),
    }
}

fn has_group_kind(obj: &DynamicObject, group: &str, kind: &str) -> bool {
    obj.types
        .as_ref()
        .is_some_and(|types| types.kind == kind && api_group(&types.api_version) == group)
}

pub(crate) fn is_namespace(obj: &DynamicObject) -> bool {
    has_group_kind(obj, Namespace::GROUP, Namespace::KIND)
}

pub(crate) fn is_crd(obj: &DynamicObject) -> bool {
    has_group_kind(
        obj,
        CustomResourceDefinition::GROUP,
        CustomResourceDefinition::KIND,
    )
}

/// The group kind a CRD object defines, if its spec names one.
pub(crate) fn crd_group_kind(obj: &DynamicObject) -> Option<GroupKind> {
    let group = obj.data.pointer("/spec/group")?.as_str()?;
    let kind = obj.data.pointer("/spec/names/kind")?.as_str()?;
    if group.is_empty() || kind.is_empty() {
        return None;
    }
    Some(GroupKind::new(group, kind))
}

#[cfg(test)]
mod tests {
    use kube_core::DynamicObject;
    use serde_json::json;

    use super::{crd_group_kind, is_crd, is_namespace, GroupKind, ObjectId, Target};

    fn object(api_version: &str, kind: &str, namespace: Option<&str>) -> DynamicObject {
        let mut metadata = json!({ "name": "example" });
        if let Some(namespace) = namespace {
            metadata["namespace"] = json!(namespace);
        }
        serde_json::from_value(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": metadata,
        }))
        .unwrap()
    }

    #[test]
    fn object_id_takes_group_from_api_version() {
        let deployment = object("apps/v1", "Deployment", Some("default"));
        assert_eq!(
            ObjectId::from_object(&deployment),
            ObjectId::new("apps", "Deployment", "default", "example")
        );

        let namespace = object("v1", "Namespace", None);
        assert_eq!(
            ObjectId::from_object(&namespace),
            ObjectId::new("", "Namespace", "", "example")
        );

        let crd = object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None);
        assert_eq!(ObjectId::from_object(&crd).group, "apiextensions.k8s.io");
    }

    #[test]
    fn recognizes_namespaces_and_crds() {
        let namespace = object("v1", "Namespace", None);
        let crd = object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None);
        let lookalike = object("example.com/v1", "Namespace", None);

        assert!(is_namespace(&namespace));
        assert!(!is_crd(&namespace));
        assert!(is_crd(&crd));
        assert!(!is_namespace(&crd));
        assert!(!is_namespace(&lookalike));
    }

    #[test]
    fn crd_group_kind_requires_group_and_kind() {
        let mut crd = object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None);
        crd.data = json!({
            "spec": { "group": "example.com", "names": { "kind": "Widget", "plural": "widgets" } },
        });
        assert_eq!(
            crd_group_kind(&crd),
            Some(GroupKind::new("example.com", "Widget"))
        );

        crd.data = json!({ "spec": { "names": { "kind": "Widget" } } });
        assert_eq!(crd_group_kind(&crd), None);

        crd.data = json!({ "spec": { "group": "example.com", "names": { "kind": "" } } });
        assert_eq!(crd_group_kind(&crd), None);

        crd.data = json!({});
        assert_eq!(crd_group_kind(&crd), None);
    }

    #[test]
    fn display_formats() {
        assert_eq!(GroupKind::new("", "Pod").to_string(), "Pod");
        assert_eq!(GroupKind::new("apps", "Deployment").to_string(), "Deployment.apps");
        assert_eq!(
            Target::new("apps", "Deployment", "team").to_string(),
            "apps/Deployment/namespaces/team"
        );
        assert_eq!(Target::new("", "Pod", "").scoped_namespace(), None);
        assert_eq!(Target::new("", "Pod", "team").scoped_namespace(), Some("team"));
    }
}
