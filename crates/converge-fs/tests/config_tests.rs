use converge_fs::{ConfigStore, Error};
use rstest::rstest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct TestConfig {
    name: String,
    count: i32,
}

#[rstest]
#[case("config.toml", "name = \"test\"\ncount = 42")]
#[case("config.json", r#"{"name": "test", "count": 42}"#)]
#[case("config.yaml", "name: test\ncount: 42")]
#[case("config.yml", "name: test\ncount: 42")]
fn test_load_by_extension(#[case] file_name: &str, #[case] content: &str) {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join(file_name);
    fs::write(&file_path, content).unwrap();

    let config: TestConfig = ConfigStore::new().load(&file_path).unwrap();

    assert_eq!(
        config,
        TestConfig {
            name: "test".into(),
            count: 42
        }
    );
}

#[test]
fn test_save_then_load_toml() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("nested/config.toml");
    let store = ConfigStore::new();
    let config = TestConfig {
        name: "saved".into(),
        count: 7,
    };

    store.save(&file_path, &config).unwrap();
    let loaded: TestConfig = store.load(&file_path).unwrap();

    assert_eq!(loaded, config);
}

#[test]
fn test_save_with_mode() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("secret.json");

    ConfigStore::with_mode(0o600)
        .save(
            &file_path,
            &TestConfig {
                name: "x".into(),
                count: 1,
            },
        )
        .unwrap();

    let mode = fs::metadata(&file_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[test]
fn test_unsupported_extension() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("config.ini");
    fs::write(&file_path, "name=test").unwrap();

    let result: Result<TestConfig, _> = ConfigStore::new().load(&file_path);

    assert!(matches!(result, Err(Error::UnsupportedFormat { .. })));
}

#[test]
fn test_parse_error_names_format() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("config.toml");
    fs::write(&file_path, "name = ").unwrap();

    let err = ConfigStore::new()
        .load::<TestConfig>(&file_path)
        .unwrap_err();

    match err {
        Error::ConfigParse { format, .. } => assert_eq!(format, "TOML"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_file_is_io_not_found() {
    let temp = TempDir::new().unwrap();
    let err = ConfigStore::new()
        .load::<TestConfig>(&temp.path().join("absent.toml"))
        .unwrap_err();
    assert!(err.is_not_found());
}
