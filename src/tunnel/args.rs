//! Argument vector construction for the tunnel tool.

use camino::Utf8Path;

use super::{SessionSpec, TunnelError};

/// Builds `[executable, --dns?, -vr, remote, subnet, extra...]`.
///
/// Empty tokens are dropped, so the vector never carries blank entries.
pub(super) fn build_tunnel_args(
    executable: &Utf8Path,
    spec: &SessionSpec,
) -> Result<Vec<String>, TunnelError> {
    let remote = spec.remote.trim();
    if remote.is_empty() {
        return Err(TunnelError::InvalidArguments(String::from(
            "remote endpoint must not be empty",
        )));
    }
    let subnet = spec.subnet.trim();
    if subnet.is_empty() {
        return Err(TunnelError::InvalidArguments(String::from(
            "subnet must not be empty",
        )));
    }
    let extra = shlex::split(&spec.extra_args).ok_or_else(|| {
        TunnelError::InvalidArguments(format!("cannot tokenise '{}'", spec.extra_args))
    })?;

    let mut args = vec![executable.as_str().to_owned()];
    if spec.proxy_dns {
        args.push(String::from("--dns"));
    }
    args.push(String::from("-vr"));
    args.push(remote.to_owned());
    args.push(subnet.to_owned());
    args.extend(extra);
    args.retain(|arg| !arg.is_empty());
    Ok(args)
}
