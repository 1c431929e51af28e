//! Property tests for the desired-state compiler.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};

use keel_compiler::Compiler;
use keel_core::{ObjectKey, Revision, TRACKING_LABEL};
use keel_source::Snapshot;
use proptest::prelude::*;

fn resource_yaml(kind: &str, name: &str, replicas: u32) -> String {
    format!(
        "kind: {kind}\nmetadata:\n  name: \"{name}\"\n  labels:\n    app: \"{name}\"\nspec:\n  replicas: {replicas}\n"
    )
}

fn overlay_yaml(environment: &str, namespace: &str) -> String {
    format!("kind: Overlay\nenvironment: {environment}\nbase: ../../base\nnamespace: {namespace}\n")
}

fn tree(resources: &BTreeMap<(String, String), u32>) -> BTreeMap<String, String> {
    let mut files: BTreeMap<String, String> = resources
        .iter()
        .map(|((kind, name), replicas)| {
            (
                format!("base/{}-{name}.yaml", kind.to_lowercase()),
                resource_yaml(kind, name, *replicas),
            )
        })
        .collect();
    files.insert("overlays/staging/overlay.yaml".to_string(), overlay_yaml("staging", "shop-staging"));
    files.insert("overlays/production/overlay.yaml".to_string(), overlay_yaml("production", "shop"));
    files
}

fn resources() -> impl Strategy<Value = BTreeMap<(String, String), u32>> {
    prop::collection::btree_map(
        (
            prop::sample::select(vec!["Deployment".to_string(), "Service".to_string(), "ConfigMap".to_string()]),
            "[a-z][a-z0-9]{0,8}",
        ),
        0u32..10,
        1..12,
    )
}

proptest! {
    #[test]
    fn compiling_twice_yields_identical_desired_sets(resources in resources()) {
        let files = tree(&resources);
        let compiler = Compiler::new("production").with_scope("shop");

        let first = compiler.compile_files(Revision::new("abc"), &files);
        let second = compiler.compile_files(Revision::new("abc"), &files);

        prop_assert!(first.is_ok());
        let (Ok(first), Ok(second)) = (first, second) else {
            return Err(TestCaseError::fail("compilation failed"));
        };
        prop_assert_eq!(&first.objects, &second.objects);
        prop_assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn every_base_resource_lands_in_the_selected_namespace(resources in resources()) {
        let snapshot = Snapshot::new(None, tree(&resources));
        let desired = Compiler::new("staging")
            .with_scope("shop")
            .compile(&snapshot)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let expected: BTreeSet<ObjectKey> = resources
            .keys()
            .map(|(kind, name)| ObjectKey::new(kind.clone(), "shop-staging", name.clone()))
            .collect();
        let actual: BTreeSet<ObjectKey> = desired.objects.keys().cloned().collect();
        prop_assert_eq!(actual, expected);

        for object in desired.objects.values() {
            let scope = object
                .field("metadata.labels")
                .and_then(|labels| labels.get(TRACKING_LABEL))
                .and_then(serde_json::Value::as_str);
            prop_assert_eq!(scope, Some("shop"));
        }
        prop_assert_eq!(desired.revision, snapshot.revision);
    }
}
