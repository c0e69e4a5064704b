//! Property-Based Tests for Slingshot
//!
//! These tests verify:
//! - Archives reproduce the tree they were built from
//! - Merging archives keeps every entry, in input order
//! - Parameter document merge laws
//! - Enum and image name string round-trips

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;

// =============================================================================
// Archive Property Tests
// =============================================================================

use slingshot::archive;

/// Strategy for a small file tree: relative path -> (content, mode)
fn file_tree_strategy() -> impl Strategy<Value = BTreeMap<String, (Vec<u8>, u32)>> {
    let name = "[a-z]{1,8}";
    let path = prop_oneof![
        name.prop_map(|n| n),
        (name, name).prop_map(|(d, n)| format!("d_{}/{}", d, n)),
    ];
    let mode = prop_oneof![Just(0o600u32), Just(0o644), Just(0o755), Just(0o640)];
    prop::collection::btree_map(
        path,
        (prop::collection::vec(any::<u8>(), 0..256), mode),
        1..8,
    )
}

fn entry_names(tar: &[u8]) -> Vec<String> {
    let mut reader = tar::Archive::new(tar);
    reader
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// build → extract reproduces content and mode of every file
    #[test]
    fn archive_restores_tree(tree in file_tree_strategy()) {
        let src = tempfile::tempdir().unwrap();
        for (path, (body, mode)) in &tree {
            let file = src.path().join(path);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(&file, body).unwrap();
            fs::set_permissions(&file, fs::Permissions::from_mode(*mode)).unwrap();
        }

        let tar = archive::build_from_paths(src.path(), &["."]).unwrap();
        let dst = tempfile::tempdir().unwrap();
        archive::extract(&tar, dst.path()).unwrap();

        for (path, (body, mode)) in &tree {
            let file = dst.path().join(path);
            prop_assert_eq!(&fs::read(&file).unwrap(), body);
            let restored = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
            prop_assert_eq!(restored, *mode);
        }
    }

    /// Merging single-file archives keeps every entry in input order
    #[test]
    fn merge_keeps_all_entries_in_order(
        files in prop::collection::vec(("[a-z]{1,10}", prop::collection::vec(any::<u8>(), 0..64)), 1..6)
    ) {
        let archives: Vec<Vec<u8>> = files
            .iter()
            .map(|(name, body)| archive::build_single_file(name, body, 0o644).unwrap())
            .collect();

        let merged = archive::merge(&archives).unwrap();

        let expected: Vec<String> = files.iter().map(|(name, _)| name.clone()).collect();
        prop_assert_eq!(entry_names(&merged), expected);

        let (body, name) = archive::first_file(&merged).unwrap();
        prop_assert_eq!(&name, &files[0].0);
        prop_assert_eq!(&body, &files[0].1);
    }

    /// A single archive merges to itself
    #[test]
    fn merge_single_is_identity(body in prop::collection::vec(any::<u8>(), 0..128)) {
        let tar = archive::build_single_file("state.tar", &body, 0o600).unwrap();
        prop_assert_eq!(archive::merge(&[tar.clone()]).unwrap(), tar);
    }
}

// =============================================================================
// Parameter Document Property Tests
// =============================================================================

use serde_yaml::{Mapping, Value};
use slingshot::parameters::ParameterDocument;

/// Strategy for nested YAML mappings with string keys
fn mapping_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[a-z][a-z0-9]{0,11}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ];
    let value = leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(|map| {
            Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| (Value::from(k), v))
                    .collect::<Mapping>(),
            )
        })
    });
    prop::collection::btree_map("[a-z]{1,4}", value, 0..5).prop_map(|map| {
        Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect::<Mapping>(),
        )
    })
}

fn document(value: &Value) -> ParameterDocument {
    ParameterDocument::from_bytes(serde_yaml::to_string(value).unwrap().as_bytes()).unwrap()
}

proptest! {
    /// Merging a document into itself changes nothing
    #[test]
    fn merge_is_idempotent(value in mapping_strategy()) {
        let mut doc = document(&value);
        doc.merge(document(&value));
        prop_assert_eq!(doc, document(&value));
    }

    /// Merging into an empty document yields the output
    #[test]
    fn merge_into_empty_yields_output(value in mapping_strategy()) {
        let mut doc = ParameterDocument::new();
        doc.merge(document(&value));
        prop_assert_eq!(doc, document(&value));
    }

    /// Every top-level scalar of the output wins
    #[test]
    fn output_scalars_win(base in mapping_strategy(), output in mapping_strategy()) {
        let mut doc = document(&base);
        doc.merge(document(&output));

        for (key, value) in output.as_mapping().unwrap() {
            if !value.is_mapping() {
                prop_assert_eq!(doc.as_value().get(key), Some(value));
            }
        }
    }

    /// Empty provider output never changes the document
    #[test]
    fn empty_output_is_noop(value in mapping_strategy()) {
        let mut doc = document(&value);
        doc.merge_bytes(b"").unwrap();
        prop_assert_eq!(doc, document(&value));
    }
}

// =============================================================================
// Name Round-Trip Property Tests
// =============================================================================

use slingshot::operation::BackendKind;
use slingshot::provider::{ImageRef, ProviderKind};

fn backend_kind_strategy() -> impl Strategy<Value = BackendKind> {
    prop_oneof![Just(BackendKind::Host), Just(BackendKind::Container)]
}

fn provider_kind_strategy() -> impl Strategy<Value = ProviderKind> {
    prop_oneof![Just(ProviderKind::Infrastructure), Just(ProviderKind::Config)]
}

proptest! {
    /// BackendKind: to_string → parse round-trip is identity
    #[test]
    fn backend_kind_roundtrip(kind in backend_kind_strategy()) {
        let parsed: BackendKind = kind.to_string().parse().expect("Should parse");
        prop_assert_eq!(kind, parsed);
    }

    /// ProviderKind: to_string → parse round-trip is identity
    #[test]
    fn provider_kind_roundtrip(kind in provider_kind_strategy()) {
        let parsed: ProviderKind = kind.to_string().parse().expect("Should parse");
        prop_assert_eq!(kind, parsed);
    }

    /// ImageRef: display → parse round-trip is identity
    #[test]
    fn image_ref_roundtrip(
        registry in proptest::option::of("[a-z]{1,8}\\.local:[0-9]{2,5}"),
        repository in "[a-z]{1,8}(/[a-z]{1,8})?",
        tag in "[a-z0-9.]{1,8}",
    ) {
        let name = match registry {
            Some(registry) => format!("{}/{}:{}", registry, repository, tag),
            None => format!("{}:{}", repository, tag),
        };
        let image = ImageRef::parse(&name).unwrap();
        prop_assert_eq!(&image.tag, &tag);
        prop_assert_eq!(image.to_string(), name);
    }
}
