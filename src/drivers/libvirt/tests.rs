//! Tests for the libvirt clone driver.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::*;
use crate::host_spec::AccessMode;
use crate::test_support::ScriptedRunner;

const BLOCK_LIST: &str = "\
 Type   Device   Target   Source
------------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/web-base.qcow2
 file   cdrom    sda      -
";

const INTERFACES: &str = "\
 Interface   Type      Source    Model    MAC
-------------------------------------------------------------
 vnet0       network   default   virtio   52:54:00:aa:bb:01
 vnet1       network   isolated  virtio   52:54:00:aa:bb:02
";

const VOLUME_INFO: &str = "\
Name:           web-base.qcow2
Type:           file
Capacity:       10737418240 bytes
Allocation:     2147483648 bytes
";

fn spec(network: Option<&str>, boot_delay: Duration, mappings: Vec<FilesystemMapping>) -> LibvirtSpec {
    LibvirtSpec {
        url: String::from("qemu:///system"),
        base_domain: String::from("web-base"),
        network: network.map(ToOwned::to_owned),
        start_timeout: Duration::from_secs(30),
        boot_delay,
        fs_mappings: mappings,
    }
}

fn shared_sources() -> FilesystemMapping {
    FilesystemMapping {
        target: String::from("src"),
        host_path: Utf8PathBuf::from("/home/dev/project"),
        access_mode: AccessMode::Mapped,
        read_only: true,
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn driver(runner: &ScriptedRunner, spec: LibvirtSpec) -> LibvirtDriver {
    LibvirtDriver::new(spec, LibvirtTools::default(), Arc::new(runner.clone()))
}

fn script_clone_up_to_start(runner: &ScriptedRunner) {
    runner.push_stdout("shut off");
    runner.push_stdout(BLOCK_LIST);
    runner.push_stdout("default");
    runner.push_stdout(VOLUME_INFO);
    runner.push_success();
    runner.push_stdout("/var/lib/libvirt/images/overlay-00.qcow2");
    runner.push_success();
}

#[test]
fn block_list_skips_empty_drives() {
    assert_eq!(
        parse_domblklist(BLOCK_LIST),
        vec![BlockDevice {
            target: String::from("vda"),
            source: String::from("/var/lib/libvirt/images/web-base.qcow2"),
        }]
    );
}

#[rstest]
#[case(VOLUME_INFO, Some(10_737_418_240))]
#[case("Name: empty\n", None)]
fn reads_volume_capacity(#[case] output: &str, #[case] expected: Option<u64>) {
    assert_eq!(parse_capacity(output), expected);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn clones_the_base_onto_overlays_and_starts_it(runner: ScriptedRunner) {
    script_clone_up_to_start(&runner);
    runner.push_output(Some(1), "", "ERROR: No matching objects found for --filesystem");
    runner.push_success();
    runner.push_success();
    runner.push_stdout("running");
    let driver = driver(
        &runner,
        spec(None, Duration::from_secs(20), vec![shared_sources()]),
    );
    let started = Instant::now();

    let handle = driver
        .create()
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(handle.id.starts_with("web-base-"), "clone named {}", handle.id);
    let clone = handle.id.as_str();
    assert_eq!(
        runner.commands(),
        vec![
            String::from("virsh -c qemu:///system domstate web-base"),
            String::from("virsh -c qemu:///system domblklist web-base --details"),
            String::from("virsh -c qemu:///system vol-pool /var/lib/libvirt/images/web-base.qcow2"),
            String::from(
                "virsh -c qemu:///system vol-info /var/lib/libvirt/images/web-base.qcow2 --bytes"
            ),
            format!(
                "virsh -c qemu:///system vol-create-as default {clone}-00.qcow2 10737418240 \
                 --format qcow2 --backing-vol /var/lib/libvirt/images/web-base.qcow2 \
                 --backing-vol-format qcow2"
            ),
            format!("virsh -c qemu:///system vol-path --pool default {clone}-00.qcow2"),
            format!(
                "virt-clone --connect qemu:///system --original web-base --name {clone} \
                 --preserve-data --file /var/lib/libvirt/images/overlay-00.qcow2"
            ),
            format!(
                "virt-xml --connect qemu:///system {clone} --remove-device --filesystem target.dir=src"
            ),
            format!(
                "virt-xml --connect qemu:///system {clone} --add-device --filesystem \
                 source.dir=/home/dev/project,target.dir=src,accessmode=mapped,readonly=on"
            ),
            format!("virsh -c qemu:///system start {clone}"),
            format!("virsh -c qemu:///system domstate {clone}"),
        ]
    );
    assert_eq!(
        handle.metadata.get("overlays").map(String::as_str),
        Some(format!("default/{clone}-00.qcow2").as_str())
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn waits_for_the_base_to_shut_down(runner: ScriptedRunner) {
    runner.push_stdout("running");
    runner.push_stdout("in shutdown");
    runner.push_stdout("shut off");
    runner.push_stdout(" Type Device Target Source\n---\n");
    runner.push_success();
    runner.push_success();
    runner.push_stdout("running");
    let driver = driver(&runner, spec(None, Duration::ZERO, Vec::new()));

    let result = driver.create().await;

    assert!(result.is_ok(), "create failed: {result:?}");
    let base_polls = runner
        .commands()
        .iter()
        .filter(|command| command.ends_with("domstate web-base"))
        .count();
    assert_eq!(base_polls, 3);
}

#[rstest]
#[tokio::test]
async fn failed_start_removes_the_clone_and_its_overlays(runner: ScriptedRunner) {
    script_clone_up_to_start(&runner);
    runner.push_output(Some(1), "", "error: internal error: qemu unexpectedly closed");
    runner.push_stdout("shut off");
    runner.push_success();
    runner.push_success();
    let driver = driver(&runner, spec(None, Duration::ZERO, Vec::new()));

    let result = driver.create().await;

    assert!(matches!(result, Err(BackendError::Creation { .. })));
    let commands = runner.commands();
    let tail: Vec<&str> = commands
        .iter()
        .rev()
        .take(2)
        .map(String::as_str)
        .collect();
    assert!(
        tail.first().is_some_and(|last| last.contains("vol-delete --pool default web-base-")),
        "overlay not deleted: {commands:?}"
    );
    assert!(
        tail.get(1).is_some_and(|undefine| undefine.contains("--managed-save --snapshots-metadata")),
        "clone not undefined: {commands:?}"
    );
}

#[rstest]
#[case(None, "52:54:00:aa:bb:01")]
#[case(Some("isolated"), "52:54:00:aa:bb:02")]
#[tokio::test]
async fn address_is_a_lookup_by_mac(
    runner: ScriptedRunner,
    #[case] network: Option<&str>,
    #[case] mac: &str,
) {
    runner.push_stdout(INTERFACES);

    let address = driver(&runner, spec(network, Duration::ZERO, Vec::new()))
        .address(&InstanceHandle::new("web-base-1"))
        .await
        .unwrap_or_else(|err| panic!("address: {err}"));

    assert_eq!(
        address,
        AddressSource::Lookup {
            key: mac.to_owned()
        }
    );
}

#[rstest]
#[tokio::test]
async fn address_without_matching_network_fails(runner: ScriptedRunner) {
    runner.push_stdout(INTERFACES);

    let result = driver(&runner, spec(Some("bridged"), Duration::ZERO, Vec::new()))
        .address(&InstanceHandle::new("web-base-1"))
        .await;

    assert!(matches!(result, Err(BackendError::Address { .. })));
}

#[rstest]
#[tokio::test]
async fn teardown_stops_undefines_and_deletes_overlays(runner: ScriptedRunner) {
    runner.push_stdout("running");
    runner.push_success();
    runner.push_success();
    runner.push_success();
    let handle = InstanceHandle::new("web-base-1")
        .with_metadata("overlays", "default/web-base-1-00.qcow2");

    driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .destroy(&handle)
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    assert_eq!(
        runner.commands(),
        vec![
            "virsh -c qemu:///system domstate web-base-1",
            "virsh -c qemu:///system destroy web-base-1",
            "virsh -c qemu:///system undefine web-base-1 --managed-save --snapshots-metadata",
            "virsh -c qemu:///system vol-delete --pool default web-base-1-00.qcow2",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn teardown_of_a_missing_domain_is_gone(runner: ScriptedRunner) {
    runner.push_output(
        Some(1),
        "",
        "error: failed to get domain 'web-base-1'",
    );

    let result = driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .destroy(&InstanceHandle::new("web-base-1"))
        .await;

    assert!(result.is_err_and(|err| err.is_gone()));
}

#[rstest]
#[tokio::test]
async fn retried_teardown_deletes_overlays_left_behind(runner: ScriptedRunner) {
    runner.push_stdout("shut off");
    runner.push_success();
    runner.push_output(Some(1), "", "error: cannot delete volume: Device or resource busy");
    runner.push_output(Some(1), "", "error: failed to get domain 'web-base-1'");
    runner.push_success();
    let handle = InstanceHandle::new("web-base-1")
        .with_metadata("overlays", "default/web-base-1-00.qcow2");
    let driver = driver(&runner, spec(None, Duration::ZERO, Vec::new()));

    let first = driver.destroy(&handle).await;
    assert!(
        matches!(first, Err(BackendError::Destroy { .. })),
        "got {first:?}"
    );

    driver
        .destroy(&handle)
        .await
        .unwrap_or_else(|err| panic!("second destroy: {err}"));

    let deletions = runner
        .commands()
        .iter()
        .filter(|command| command.ends_with("vol-delete --pool default web-base-1-00.qcow2"))
        .count();
    assert_eq!(deletions, 2);
}

#[rstest]
#[tokio::test]
async fn teardown_with_domain_and_overlays_gone_is_gone(runner: ScriptedRunner) {
    runner.push_output(Some(1), "", "error: failed to get domain 'web-base-1'");
    runner.push_output(
        Some(1),
        "",
        "error: failed to get vol 'web-base-1-00.qcow2'\nerror: Storage volume not found: no storage vol with matching name",
    );
    let handle = InstanceHandle::new("web-base-1")
        .with_metadata("overlays", "default/web-base-1-00.qcow2");

    let result = driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .destroy(&handle)
        .await;

    assert!(result.is_err_and(|err| err.is_gone()));
    assert_eq!(runner.commands().len(), 2);
}

const IMAGE_STAMP: &str = r#"{"overcast":"image","key":"web","tag":"v2"}"#;
const STALE_STAMP: &str = r#"{"overcast":"image","key":"web","tag":"v1"}"#;

const IMAGE_BLOCK_LIST: &str = "\
 Type   Device   Target   Source
------------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/web-base-old-00.qcow2
";

#[rstest]
#[tokio::test]
async fn finds_the_image_with_a_matching_tag_and_drops_the_stale_one(runner: ScriptedRunner) {
    runner.push_stdout("web-base\nweb-base-new\nweb-base-old\nweb-base-plain\nother\n");
    runner.push_stdout(IMAGE_STAMP);
    runner.push_stdout(STALE_STAMP);
    runner.push_stdout("hand-made domain");
    runner.push_stdout(IMAGE_BLOCK_LIST);
    runner.push_success();
    runner.push_success();

    let found = driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .find("web", "v2")
        .await
        .unwrap_or_else(|err| panic!("find: {err}"));

    assert_eq!(found.as_deref(), Some("web-base-new"));
    assert_eq!(
        runner.commands(),
        vec![
            "virsh -c qemu:///system list --all --name",
            "virsh -c qemu:///system desc web-base-new",
            "virsh -c qemu:///system desc web-base-old",
            "virsh -c qemu:///system desc web-base-plain",
            "virsh -c qemu:///system domblklist web-base-old --details",
            "virsh -c qemu:///system undefine web-base-old --managed-save --snapshots-metadata",
            "virsh -c qemu:///system vol-delete /var/lib/libvirt/images/web-base-old-00.qcow2",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn stale_image_backing_a_clone_is_kept(runner: ScriptedRunner) {
    runner.push_stdout("web-base-old\nweb-base-1\n");
    runner.push_stdout(STALE_STAMP);
    runner.push_stdout(r#"{"overcast":"clone","image":"web-base-old"}"#);

    let found = driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .find("web", "v2")
        .await
        .unwrap_or_else(|err| panic!("find: {err}"));

    assert_eq!(found, None);
    assert!(
        runner.commands().iter().all(|command| !command.contains("undefine")),
        "image removed: {:?}",
        runner.commands()
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn capture_shuts_the_clone_down_and_stamps_it(runner: ScriptedRunner) {
    runner.push_success();
    runner.push_stdout("in shutdown");
    runner.push_stdout("shut off");
    runner.push_success();
    let clone = InstanceHandle::new("web-base-1")
        .with_metadata("overlays", "default/web-base-1-00.qcow2");

    let image = driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .capture(&clone, "web", "v2")
        .await
        .unwrap_or_else(|err| panic!("capture: {err}"));

    assert_eq!(image, "web-base-1");
    assert_eq!(
        runner.commands(),
        vec![
            String::from("virsh -c qemu:///system shutdown web-base-1"),
            String::from("virsh -c qemu:///system domstate web-base-1"),
            String::from("virsh -c qemu:///system domstate web-base-1"),
            format!("virsh -c qemu:///system desc web-base-1 --config --new-desc {IMAGE_STAMP}"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn clone_from_an_image_is_stamped_before_it_starts(runner: ScriptedRunner) {
    runner.push_stdout("shut off");
    runner.push_stdout(IMAGE_BLOCK_LIST);
    runner.push_stdout("default");
    runner.push_stdout(VOLUME_INFO);
    runner.push_success();
    runner.push_stdout("/var/lib/libvirt/images/overlay-00.qcow2");
    runner.push_success();
    runner.push_success();
    runner.push_success();
    runner.push_stdout("running");

    let handle = driver(&runner, spec(None, Duration::ZERO, Vec::new()))
        .create_from("web-base-old")
        .await
        .unwrap_or_else(|err| panic!("create from image: {err}"));

    let clone = handle.id.as_str();
    let commands = runner.commands();
    assert_eq!(
        commands.first().map(String::as_str),
        Some("virsh -c qemu:///system domstate web-base-old")
    );
    assert!(
        commands.iter().any(|command| command.starts_with(
            "virt-clone --connect qemu:///system --original web-base-old --name"
        )),
        "not cloned from the image: {commands:?}"
    );
    assert_eq!(
        commands.get(7).map(String::as_str),
        Some(
            format!(
                r#"virsh -c qemu:///system desc {clone} --config --new-desc {{"overcast":"clone","image":"web-base-old"}}"#
            )
            .as_str()
        )
    );
    assert_eq!(
        commands.get(8).map(String::as_str),
        Some(format!("virsh -c qemu:///system start {clone}").as_str())
    );
}

#[test]
fn libvirt_reuses_provisioned_images() {
    let runner = ScriptedRunner::new();
    let driver = driver(&runner, spec(None, Duration::ZERO, Vec::new()));

    assert!(matches!(driver.provision_reuse(), ProvisionReuse::Images(_)));
}
