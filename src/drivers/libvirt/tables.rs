//! Parsers for the tabular output of `virsh`.

/// A disk attached to a domain, as listed by `domblklist --details`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDevice {
    /// Guest device name, for example `vda`.
    pub target: String,
    /// Path of the backing file on the hypervisor.
    pub source: String,
}

/// A network interface, as listed by `domiflist`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    /// Network or bridge the interface is attached to.
    pub source: String,
    /// MAC address of the interface.
    pub mac: String,
}

/// Rows below the dashed separator line, split on whitespace.
fn rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|columns| !columns.is_empty())
}

/// Disks of a domain, skipping CD-ROMs and empty drives.
#[must_use]
pub fn parse_domblklist(output: &str) -> Vec<BlockDevice> {
    rows(output)
        .filter_map(|columns| match columns.as_slice() {
            [_, "disk", target, source] if *source != "-" => Some(BlockDevice {
                target: (*target).to_owned(),
                source: (*source).to_owned(),
            }),
            _ => None,
        })
        .collect()
}

/// Interfaces of a domain in declaration order.
#[must_use]
pub fn parse_domiflist(output: &str) -> Vec<Interface> {
    rows(output)
        .filter_map(|columns| match columns.as_slice() {
            [_, _, source, _, mac] => Some(Interface {
                source: (*source).to_owned(),
                mac: (*mac).to_owned(),
            }),
            _ => None,
        })
        .collect()
}

/// Capacity in bytes from `vol-info --bytes`.
#[must_use]
pub fn parse_capacity(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix("Capacity:")?;
        value.split_whitespace().next()?.parse().ok()
    })
}
