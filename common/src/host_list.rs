// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Expected cluster membership, derived from the instance configuration.

/// Returns every hostname expected to exist for a cluster of the given
/// shape: one `segment-a-<i>` per segment index, a matching
/// `segment-b-<i>` when mirrors are enabled, `master-0`, and `master-1`
/// when a standby is configured.
///
/// When `dns_suffix` is non-empty (e.g. `".gpdb.svc.cluster.local"`),
/// the suffixed variant of each hostname is included as well, so callers
/// can wait on both the short and fully-qualified names.
pub fn generate_host_list(
    segment_count: u32,
    use_mirrors: bool,
    use_standby: bool,
    dns_suffix: &str,
) -> Vec<String> {
    let mut host_list =
        host_list_with_suffix(segment_count, use_mirrors, use_standby, "");
    if !dns_suffix.is_empty() {
        host_list.extend(host_list_with_suffix(
            segment_count,
            use_mirrors,
            use_standby,
            dns_suffix,
        ));
    }
    host_list
}

fn host_list_with_suffix(
    segment_count: u32,
    use_mirrors: bool,
    use_standby: bool,
    dns_suffix: &str,
) -> Vec<String> {
    let mut hostnames = Vec::new();
    for i in 0..segment_count {
        hostnames.push(format!("segment-a-{i}{dns_suffix}"));
        if use_mirrors {
            hostnames.push(format!("segment-b-{i}{dns_suffix}"));
        }
    }
    hostnames.push(format!("master-0{dns_suffix}"));
    if use_standby {
        hostnames.push(format!("master-1{dns_suffix}"));
    }
    hostnames
}
