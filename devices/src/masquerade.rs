use ipnet::IpNet;
use weft_config::Family;

pub const MASQUERADE_CHAIN: &str = "WEFT-POSTRTG";

/// Rules of [`MASQUERADE_CHAIN`] in the `nat` table, in order.
///
/// Pod to pod traffic keeps its source, pod to the outside world is
/// masqueraded, and traffic entering the cluster network from elsewhere is
/// masqueraded unless it targets this node's pods.
pub fn masquerade_rules(
    family: Family,
    cluster: IpNet,
    pod: IpNet,
    random_fully: bool,
) -> Vec<Vec<String>> {
    let cluster = cluster.trunc().to_string();
    let pod = pod.trunc().to_string();
    let (cluster, pod) = (cluster.as_str(), pod.as_str());
    let multicast = match family {
        Family::V4 => "224.0.0.0/4",
        Family::V6 => "ff00::/8",
    };

    let masquerade = |mut rule: Vec<String>| {
        rule.extend(["-j".into(), "MASQUERADE".into()]);
        if random_fully {
            rule.push("--random-fully".into());
        }
        rule
    };
    let ret = |mut rule: Vec<String>| {
        rule.extend(["-j".into(), "RETURN".into()]);
        rule
    };
    let args = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    vec![
        ret(args(&[
            "-s", cluster, "-d", cluster,
            "-m", "comment", "--comment", "weft: pod to pod",
        ])),
        masquerade(args(&[
            "-s", cluster, "!", "-d", multicast,
            "-m", "comment", "--comment", "weft: pod to external",
        ])),
        ret(args(&[
            "!", "-s", cluster, "-d", pod,
            "-m", "comment", "--comment", "weft: external to local pods",
        ])),
        masquerade(args(&[
            "!", "-s", cluster, "-d", cluster,
            "-m", "comment", "--comment", "weft: external to remote pods",
        ])),
    ]
}

/// `--random-fully` needs iptables 1.6.2 or newer.
pub fn supports_random_fully(version_output: &str) -> bool {
    let Some(version) = version_output
        .split_whitespace()
        .find_map(|word| word.strip_prefix('v'))
    else {
        return false;
    };

    let parts = version
        .split('.')
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>();

    match parts.as_deref() {
        Ok([major, minor, patch, ..]) => (*major, *minor, *patch) >= (1, 6, 2),
        Ok([major, minor]) => (*major, *minor) > (1, 6),
        _ => false,
    }
}
