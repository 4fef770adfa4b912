use kube::ResourceExt;
use kube::core::DynamicObject;

use crate::crd::{MANAGED_DEPLOY_ITEM_LABEL, MANAGED_INSTANCE_LABEL, ManifestPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyDecision {
    Create,
    Apply,
    Skip,
}

/// Decide what to do with one desired resource given what the store holds.
pub fn decide(policy: ManifestPolicy, exists: bool, owned: bool) -> ApplyDecision {
    match (policy, exists, owned) {
        (ManifestPolicy::Ignore, _, _) => ApplyDecision::Skip,
        (_, false, _) => ApplyDecision::Create,
        (ManifestPolicy::Fallback, true, false) => ApplyDecision::Skip,
        (ManifestPolicy::Manage | ManifestPolicy::Keep | ManifestPolicy::Fallback, true, _) => {
            ApplyDecision::Apply
        }
    }
}

/// Identity of the writer: one deployer instance acting for one deploy item.
#[derive(Clone, Debug)]
pub struct Ownership {
    pub instance_id: String,
    pub deploy_item: String,
}

impl Ownership {
    pub fn new(instance_id: impl Into<String>, deploy_item: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            deploy_item: deploy_item.into(),
        }
    }

    pub fn stamp(&self, obj: &mut DynamicObject) {
        let labels = obj.labels_mut();
        labels.insert(MANAGED_INSTANCE_LABEL.to_string(), self.instance_id.clone());
        labels.insert(
            MANAGED_DEPLOY_ITEM_LABEL.to_string(),
            self.deploy_item.clone(),
        );
    }

    /// An object belongs to us when it names our deploy item and carries no
    /// conflicting instance label.
    pub fn owns(&self, obj: &DynamicObject) -> bool {
        let labels = obj.labels();
        let item_matches = labels
            .get(MANAGED_DEPLOY_ITEM_LABEL)
            .map(|v| *v == self.deploy_item)
            .unwrap_or(false);
        let instance_matches = labels
            .get(MANAGED_INSTANCE_LABEL)
            .map(|v| *v == self.instance_id)
            .unwrap_or(true);
        item_matches && instance_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployer_store::object::object_ref;
    use kube::core::GroupVersionKind;

    #[test]
    fn decision_table() {
        use ApplyDecision::*;
        use ManifestPolicy::*;
        let cases = [
            (Manage, false, false, Create),
            (Manage, true, false, Apply),
            (Manage, true, true, Apply),
            (Keep, false, false, Create),
            (Keep, true, false, Apply),
            (Fallback, false, false, Create),
            (Fallback, true, false, Skip),
            (Fallback, true, true, Apply),
            (Ignore, false, false, Skip),
            (Ignore, true, true, Skip),
        ];
        for (policy, exists, owned, want) in cases {
            assert_eq!(
                decide(policy, exists, owned),
                want,
                "policy={policy:?} exists={exists} owned={owned}"
            );
        }
    }

    fn cm() -> DynamicObject {
        object_ref(&GroupVersionKind::gvk("", "v1", "ConfigMap"), Some("default"), "cfg")
    }

    #[test]
    fn stamped_objects_are_owned() {
        let owner = Ownership::new("default", "web");
        let mut obj = cm();
        assert!(!owner.owns(&obj));
        owner.stamp(&mut obj);
        assert!(owner.owns(&obj));
        assert!(!Ownership::new("default", "api").owns(&obj));
        assert!(!Ownership::new("other", "web").owns(&obj));
    }

    #[test]
    fn missing_instance_label_still_counts_as_owned() {
        let owner = Ownership::new("default", "web");
        let mut obj = cm();
        obj.labels_mut()
            .insert(MANAGED_DEPLOY_ITEM_LABEL.to_string(), "web".to_string());
        assert!(owner.owns(&obj));
    }
}
