//! Monotone policy intersection.
//!
//! `intersect(server, client)` produces a policy no more permissive than
//! either input: allow-sets shrink, deny-sets grow, flags tighten, numeric
//! limits take the minimum. It is a pure function and runs once per capsule
//! build.

use std::collections::HashSet;

use crate::model::{
    FsOverride, FsPolicy, Limits, LimitsOverride, NetworkOverride, NetworkPolicy, Policy,
    PolicyOverride,
};

/// Combine the server default policy with an optional client override.
#[must_use]
pub fn intersect(server: &Policy, client: Option<&PolicyOverride>) -> Policy {
    let Some(client) = client else {
        return server.clone();
    };

    Policy {
        network: server
            .network
            .as_ref()
            .map(|net| intersect_network(net, client.network.as_ref())),
        filesystem: intersect_fs(&server.filesystem, client.filesystem.as_ref()),
        limits: intersect_limits(server.limits, client.limits),
    }
}

fn intersect_network(server: &NetworkPolicy, client: Option<&NetworkOverride>) -> NetworkPolicy {
    let Some(client) = client else {
        return server.clone();
    };

    let allowed_domains = match &client.allowed_domains {
        Some(theirs) => {
            let theirs: HashSet<&str> = theirs.iter().map(String::as_str).collect();
            server
                .allowed_domains
                .iter()
                .filter(|d| theirs.contains(d.as_str()))
                .cloned()
                .collect()
        },
        None => server.allowed_domains.clone(),
    };

    let mut denied_domains = server.denied_domains.clone();
    if let Some(theirs) = &client.denied_domains {
        for d in theirs {
            if !denied_domains.contains(d) {
                denied_domains.push(d.clone());
            }
        }
    }

    NetworkPolicy {
        allowed_domains,
        denied_domains,
        deny_ip_literals: server.deny_ip_literals || client.deny_ip_literals.unwrap_or(false),
        block_private_ranges: server.block_private_ranges
            || client.block_private_ranges.unwrap_or(false),
        max_body_bytes: client
            .max_body_bytes
            .map_or(server.max_body_bytes, |c| c.min(server.max_body_bytes)),
        max_redirects: client
            .max_redirects
            .map_or(server.max_redirects, |c| c.min(server.max_redirects)),
    }
}

fn intersect_fs(server: &FsPolicy, client: Option<&FsOverride>) -> FsPolicy {
    let Some(client) = client else {
        return server.clone();
    };

    let intersect_paths = |ours: &[String], theirs: &Option<Vec<String>>| match theirs {
        Some(theirs) => {
            let theirs: HashSet<&str> = theirs.iter().map(String::as_str).collect();
            ours.iter()
                .filter(|p| theirs.contains(p.as_str()))
                .cloned()
                .collect()
        },
        None => ours.to_vec(),
    };

    // Mounts concatenate; a client mount is appended, never replaces a
    // server mount at the same target.
    let mounts = match (&server.mounts, &client.mounts) {
        (None, None) => None,
        (Some(s), None) => Some(s.clone()),
        (None, Some(c)) => Some(c.clone()),
        (Some(s), Some(c)) => {
            let mut all = s.clone();
            all.extend(c.iter().cloned());
            Some(all)
        },
    };

    FsPolicy {
        readonly: intersect_paths(&server.readonly, &client.readonly),
        writable: intersect_paths(&server.writable, &client.writable),
        mounts,
    }
}

fn intersect_limits(server: Limits, client: Option<LimitsOverride>) -> Limits {
    let Some(client) = client else {
        return server;
    };

    Limits {
        timeout_ms: client
            .timeout_ms
            .map_or(server.timeout_ms, |c| c.min(server.timeout_ms)),
        mem_mb: client.mem_mb.map_or(server.mem_mb, |c| c.min(server.mem_mb)),
        stdout_bytes: client
            .stdout_bytes
            .map_or(server.stdout_bytes, |c| c.min(server.stdout_bytes)),
    }
}
