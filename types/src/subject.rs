//! Subject and stream naming conventions for the bus.
//!
//! Subjects are dot-joined segments, e.g. `eth.rpc.1.1.<clientId>` for
//! per-client RPC and `eth.newHeads.1.1.<name>.<version>.<clientId>` for
//! head publication.

/// Join `segments` into a dot-separated subject.
pub fn subject_name<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments
        .into_iter()
        .map(|segment| segment.as_ref().to_owned())
        .collect::<Vec<_>>()
        .join(".")
}

/// Version strings contain `.` and `-` which are not valid inside a
/// subject segment.
pub fn sanitize_version_token(version: &str) -> String {
    version.replace('.', "_").replace('-', "_")
}

#[must_use]
pub fn rpc_subject_prefix(network_id: u64, chain_id: u64) -> String {
    subject_name(&[
        "eth",
        "rpc",
        network_id.to_string().as_str(),
        chain_id.to_string().as_str(),
    ])
}

#[must_use]
pub fn rpc_subject(network_id: u64, chain_id: u64, client_id: &str) -> String {
    subject_name(&[rpc_subject_prefix(network_id, chain_id).as_str(), client_id])
}

#[must_use]
pub fn new_heads_subject(
    network_id: u64,
    chain_id: u64,
    name: &str,
    version: &str,
    client_id: &str,
) -> String {
    subject_name(&[
        "eth",
        "newHeads",
        network_id.to_string().as_str(),
        chain_id.to_string().as_str(),
        name,
        sanitize_version_token(version).as_str(),
        client_id,
    ])
}

#[must_use]
pub fn new_heads_stream_name(network_id: u64, chain_id: u64) -> String {
    format!("eth_{}_{}_newHeads", network_id, chain_id)
}

/// Subject pattern covering every publisher on the stream.
#[must_use]
pub fn new_heads_stream_subjects(network_id: u64, chain_id: u64) -> Vec<String> {
    vec![subject_name(&[
        "eth",
        "newHeads",
        network_id.to_string().as_str(),
        chain_id.to_string().as_str(),
        "*",
        "*",
        "*",
    ])]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rpc_subjects() {
        assert_eq!(rpc_subject_prefix(1, 1), "eth.rpc.1.1");
        assert_eq!(rpc_subject(1, 5, "abc"), "eth.rpc.1.5.abc");
    }

    #[test]
    fn new_heads_subject_sanitizes_version() {
        assert_eq!(
            new_heads_subject(1, 1, "Geth", "v1.10.8-stable", "abc"),
            "eth.newHeads.1.1.Geth.v1_10_8_stable.abc"
        );
    }

    #[test]
    fn stream_naming() {
        assert_eq!(new_heads_stream_name(1, 1), "eth_1_1_newHeads");
        assert_eq!(
            new_heads_stream_subjects(1, 1),
            vec!["eth.newHeads.1.1.*.*.*".to_owned()]
        );
    }
}
