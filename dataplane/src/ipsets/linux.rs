//! Flushes the IP set graph to the kernel through ipset restore
//!
//! Every dirty set becomes one section of a restore file: create the set,
//! rebuild its membership in a temporary set, swap the two, and destroy the
//! temporary. Deletions flush and destroy. A destroy that fails because the
//! kernel still sees the set in use aborts only that set's section and is
//! re-marked dirty for the next apply.

use std::sync::{Arc, Mutex};
use tracing::{Level, event};

use warden::Error;
use warden::conf::LinuxConf;
use warden::models::{IpSetSnapshot, SetKind, SetType, hashed_name};

use crate::restore::{CommandRunner, ErrorHandler, FileCreator, LineErrorRule};

/// The pattern ipset restore reports failing line numbers with
const LINE_FAILURE: &str = r"rror in line (\d+)";

/// The error ipset reports for a set something still references
const SET_IN_USE: &str = "is in use";

/// The error ipset reports for a missing set
const SET_MISSING: &str = "does not exist";

/// Get the kernel set type for a set
///
/// # Arguments
///
/// * `snapshot` - The set to pick a kernel type for
fn kernel_type(snapshot: &IpSetSnapshot) -> &'static str {
    match snapshot.metadata.as_ref().map(|meta| meta.set_type) {
        Some(SetType::CidrBlocks) => "hash:net",
        Some(SetType::NamedPorts) => "hash:ip,port",
        Some(meta) if meta.kind() == SetKind::List => "list:set",
        _ => "hash:ip",
    }
}

/// Flush dirty sets to the kernel with one ipset restore transaction
///
/// Returns the deleted names whose destroy was omitted so the caller can mark
/// them dirty again.
///
/// # Arguments
///
/// * `runner` - The runner executing ipset
/// * `conf` - The Linux dataplane config
/// * `to_update` - The sets to create or rebuild
/// * `to_delete` - The prefixed names of the sets to destroy
pub async fn apply(
    runner: &dyn CommandRunner,
    conf: &LinuxConf,
    to_update: &[IpSetSnapshot],
    to_delete: &[String],
) -> Result<Vec<String>, Error> {
    let mut creator = FileCreator::new(conf.max_try_count, &[LINE_FAILURE])?;
    // destroys that get omitted are retried on the next apply
    let failed_deletes: Arc<Mutex<Vec<String>>> = Arc::default();
    for name in to_delete {
        let hashed = hashed_name(name);
        creator.add_line(
            Some(name),
            vec![ErrorHandler::new(SET_MISSING, LineErrorRule::Continue)?],
            format!("flush {hashed}"),
        );
        let failed = failed_deletes.clone();
        let doomed = name.clone();
        creator.add_line(
            Some(name),
            vec![
                ErrorHandler::new(SET_IN_USE, LineErrorRule::ContinueAndAbortSection)?
                    .with_callback(move || failed.lock().unwrap().push(doomed.clone())),
                ErrorHandler::new(SET_MISSING, LineErrorRule::Continue)?,
            ],
            format!("destroy {hashed}"),
        );
    }
    for snapshot in to_update {
        let Some(meta) = &snapshot.metadata else {
            continue;
        };
        let name = meta.prefixed_name();
        let hashed = meta.hashed_name();
        let tmp = format!("{hashed}-tmp");
        let kernel = kernel_type(snapshot);
        // rebuild membership beside the live set and swap the two
        creator.add_line(Some(&name), Vec::default(), format!("create {hashed} {kernel}"));
        creator.add_line(Some(&name), Vec::default(), format!("create {tmp} {kernel}"));
        creator.add_line(Some(&name), Vec::default(), format!("flush {tmp}"));
        match meta.kind() {
            SetKind::Hash => {
                for member in &snapshot.members {
                    creator.add_line(
                        Some(&name),
                        vec![ErrorHandler::new(
                            "Syntax error",
                            LineErrorRule::ContinueAndAbortSection,
                        )?],
                        format!("add {tmp} {}", member.ip),
                    );
                }
            }
            SetKind::List => {
                for member in &snapshot.member_sets {
                    creator.add_line(
                        Some(&name),
                        vec![ErrorHandler::new(SET_MISSING, LineErrorRule::Continue)?],
                        format!("add {tmp} {}", member.hashed_name()),
                    );
                }
            }
        }
        creator.add_line(
            Some(&name),
            vec![ErrorHandler::new(SET_IN_USE, LineErrorRule::ContinueAndAbortSection)?],
            format!("swap {tmp} {hashed}"),
        );
        creator.add_line(
            Some(&name),
            vec![ErrorHandler::new(SET_MISSING, LineErrorRule::Continue)?],
            format!("destroy {tmp}"),
        );
    }
    let args = vec!["-exist".to_owned(), "restore".to_owned()];
    creator.run(runner, &conf.ipset, &args).await?;
    let failed = failed_deletes.lock().unwrap().clone();
    if !failed.is_empty() {
        event!(
            Level::WARN,
            count = failed.len(),
            "some set destroys were deferred to the next apply"
        );
    }
    Ok(failed)
}

/// Destroy any leftover kernel sets from an earlier run
///
/// # Arguments
///
/// * `runner` - The runner executing ipset
/// * `conf` - The Linux dataplane config
pub async fn destroy_leftovers(runner: &dyn CommandRunner, conf: &LinuxConf) -> Result<(), Error> {
    // snapshot the kernel's set names
    let args = vec!["-n".to_owned(), "list".to_owned()];
    let out = runner.run(&conf.ipset, &args, "").await?;
    if !out.success() {
        return Err(Error::transient(format!(
            "ipset list failed: {}",
            out.stderr
        )));
    }
    let leftovers: Vec<&str> = out
        .stdout
        .lines()
        .filter(|line| line.starts_with("azure-npm-"))
        .collect();
    if leftovers.is_empty() {
        return Ok(());
    }
    event!(Level::INFO, count = leftovers.len(), "destroying leftover kernel sets");
    let mut creator = FileCreator::new(conf.max_try_count, &[LINE_FAILURE])?;
    for name in leftovers {
        creator.add_line(
            Some(name),
            vec![ErrorHandler::new(SET_MISSING, LineErrorRule::Continue)?],
            format!("flush {name}"),
        );
        creator.add_line(
            Some(name),
            vec![
                ErrorHandler::new(SET_IN_USE, LineErrorRule::ContinueAndAbortSection)?,
                ErrorHandler::new(SET_MISSING, LineErrorRule::Continue)?,
            ],
            format!("destroy {name}"),
        );
    }
    let args = vec!["-exist".to_owned(), "restore".to_owned()];
    creator.run(runner, &conf.ipset, &args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::{IpSetMetadata, PodMetadata};

    /// Build a hash set snapshot for tests
    fn hash_snapshot(name: &str, set_type: SetType, ips: &[&str]) -> IpSetSnapshot {
        IpSetSnapshot {
            metadata: Some(IpSetMetadata::new(name, set_type)),
            generation: 1,
            members: ips
                .iter()
                .map(|ip| PodMetadata::new(*ip, "x/a", "node-1"))
                .collect(),
            member_sets: Vec::default(),
        }
    }

    #[test]
    fn kernel_types_match_set_types() {
        assert_eq!(kernel_type(&hash_snapshot("x", SetType::Namespace, &[])), "hash:ip");
        assert_eq!(kernel_type(&hash_snapshot("c", SetType::CidrBlocks, &[])), "hash:net");
        assert_eq!(kernel_type(&hash_snapshot("p", SetType::NamedPorts, &[])), "hash:ip,port");
        let list = IpSetSnapshot {
            metadata: Some(IpSetMetadata::new("team", SetType::KeyLabelOfNamespace)),
            ..IpSetSnapshot::default()
        };
        assert_eq!(kernel_type(&list), "list:set");
    }
}
