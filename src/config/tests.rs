//! Tests for configuration loading and host property access.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

fn parse(json: &str) -> HostProperties {
    HostProperties::from_json_str(Utf8Path::new("inline.json"), json)
        .unwrap_or_else(|err| panic!("parse properties: {err}"))
}

#[fixture]
fn nested() -> HostProperties {
    parse(
        r#"{
            "web": {
                "baseDomain": "ubuntu-base",
                "SSH": {"timeout": 30},
                "remove": true,
                "provision": {"copy": ["a", "b", "c"]},
                "fsMapping": {
                    "data": {"hostPath": "/srv/data", "readOnly": "yes"},
                    "logs": {"hostPath": "/var/log"}
                },
                "tunnel": {"password": "s3cret"}
            },
            "web.exposedPorts": "22/tcp, 80/tcp"
        }"#,
    )
}

#[rstest]
fn nested_objects_flatten_to_dotted_keys(nested: HostProperties) {
    let scope = nested.scope("web");
    assert_eq!(scope.get("baseDomain"), Some("ubuntu-base"));
    assert_eq!(scope.get("SSH.timeout"), Some("30"));
    assert_eq!(scope.get_bool("remove", false), Ok(true));
    assert_eq!(scope.get_list("provision.copy"), vec!["a", "b", "c"]);
}

#[rstest]
fn scalar_lists_split_on_commas(nested: HostProperties) {
    assert_eq!(
        nested.scope("web").get_list("exposedPorts"),
        vec!["22/tcp", "80/tcp"]
    );
}

#[rstest]
fn children_lists_mapping_targets(nested: HostProperties) {
    let children: Vec<String> = nested.scope("web").children("fsMapping").into_iter().collect();
    assert_eq!(children, vec!["data", "logs"]);
}

#[rstest]
fn typed_getters_fall_back_to_defaults(nested: HostProperties) {
    let scope = nested.scope("web");
    assert_eq!(scope.get_secs("SSH.timeout", 60), Ok(Duration::from_secs(30)));
    assert_eq!(scope.get_secs("provision.startTimeout", 60), Ok(Duration::from_secs(60)));
    assert_eq!(scope.get_or("libvirtURL", "qemu:///system"), "qemu:///system");
}

#[rstest]
fn require_reports_fully_qualified_key(nested: HostProperties) {
    assert_eq!(
        nested.scope("web").require("amiId"),
        Err(ConfigError::MissingKey {
            key: String::from("web.amiId")
        })
    );
}

#[rstest]
#[case("maybe")]
#[case("2")]
fn get_bool_rejects_unknown_words(#[case] raw: &str) {
    let mut props = HostProperties::new();
    props.set("db.remove", raw);
    let Err(err) = props.scope("db").get_bool("remove", false) else {
        panic!("{raw} should be rejected");
    };
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[rstest]
fn passwords_are_masked(nested: HostProperties) {
    assert_eq!(
        nested.display_value("web.tunnel.password").as_deref(),
        Some("********")
    );
    let err = nested.scope("web").invalid("tunnel.password", "s3cret", "bad");
    assert!(!err.to_string().contains("s3cret"));
}

#[test]
fn later_layers_override_earlier_ones() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non utf-8 temp path: {}", path.display()));
    let user = root.join("user.json");
    let project = root.join("overcast.json");
    std::fs::write(&user, r#"{"web": {"dockerImage": "busybox", "remove": "true"}}"#)
        .unwrap_or_else(|err| panic!("write user file: {err}"));
    std::fs::write(&project, r#"{"web.dockerImage": "alpine"}"#)
        .unwrap_or_else(|err| panic!("write project file: {err}"));

    let props = HostProperties::load_layers(&[user, root.join("absent.json"), project])
        .unwrap_or_else(|err| panic!("load layers: {err}"));

    let scope = props.scope("web");
    assert_eq!(scope.get("dockerImage"), Some("alpine"));
    assert_eq!(scope.get("remove"), Some("true"));
}

#[test]
fn malformed_json_is_reported_with_path() {
    let Err(err) = HostProperties::from_json_str(Utf8Path::new("bad.json"), "[1, 2]") else {
        panic!("arrays at the top level should be rejected");
    };
    assert!(err.to_string().contains("bad.json"));
}

#[test]
fn ssh_settings_follow_global_config() {
    let config = OvercastConfig {
        ssh_bin: String::from("/usr/local/bin/ssh"),
        ssh_strict_host_key_checking: true,
        ..OvercastConfig::default()
    };
    let settings = config.ssh_settings();
    assert_eq!(settings.ssh_bin, "/usr/local/bin/ssh");
    assert!(settings.strict_host_key_checking);
    assert_eq!(settings.scp_bin, "scp");
}
