//! Installs translated policies as iptables chains
//!
//! Traffic enters through a jump from FORWARD into AZURE-NPM, which fans out
//! to the ingress and egress chains. Each policy owns one AZURE-NPM-<hash>
//! sub-chain; verdicts are expressed as mark bits that the top level chains
//! turn into DROP or ACCEPT. Installs are single iptables-restore
//! transactions built by the restore file creator.

use sha2::{Digest, Sha256};
use tracing::{Level, event};

use warden::Error;
use warden::conf::LinuxConf;
use warden::models::{AclPolicy, Direction, NpmNetworkPolicy, Protocol, SetInfo, Verdict};

use crate::restore::{CommandRunner, ErrorHandler, FileCreator, LineErrorRule};

/// The chain FORWARD jumps into
pub const AZURE_NPM: &str = "AZURE-NPM";

/// The chain ingress policy sub-chains hang off of
pub const AZURE_NPM_INGRESS: &str = "AZURE-NPM-INGRESS";

/// The chain egress policy sub-chains hang off of
pub const AZURE_NPM_EGRESS: &str = "AZURE-NPM-EGRESS";

/// The chain that marks allowed ingress traffic and hands it to egress
pub const AZURE_NPM_INGRESS_ALLOW_MARK: &str = "AZURE-NPM-INGRESS-ALLOW-MARK";

/// The chain that clears marks and accepts
pub const AZURE_NPM_ACCEPT: &str = "AZURE-NPM-ACCEPT";

/// The mark bit for dropped ingress traffic
pub const INGRESS_DROP_MARK: &str = "0x4000";

/// The mark bit for dropped egress traffic
pub const EGRESS_DROP_MARK: &str = "0x5000";

/// The mark bit for allowed ingress traffic
pub const INGRESS_ALLOW_MARK: &str = "0x2000";

/// The mark value that clears all npm marks
pub const CLEAR_MARK: &str = "0x0";

/// The pattern iptables-restore reports failing line numbers with
const LINE_FAILURE: &str = r"line:?\s+(\d+)";

/// The error iptables emits while another process holds its lock
const XTABLES_LOCK: &str = "holding the xtables lock";

/// The error iptables emits for a missing chain, target, or match
const NO_SUCH_TARGET: &str = "No chain/target/match by that name";

/// Get the sub-chain a policy owns
///
/// # Arguments
///
/// * `policy_key` - The namespace/name key of the policy
pub fn policy_chain(policy_key: &str) -> String {
    let digest = Sha256::digest(policy_key.as_bytes());
    format!("{}-{}", AZURE_NPM, &hex::encode(digest)[..10])
}

/// Render the set matches of one ACL side
///
/// # Arguments
///
/// * `sets` - The sets to match
/// * `flag` - Whether they match the src or dst side
fn set_matches(sets: &[SetInfo], flag: &str) -> String {
    let mut rendered = String::new();
    for info in sets {
        let negate = if info.included { "" } else { "! " };
        rendered.push_str(&format!(
            " -m set {negate}--match-set {} {flag}",
            info.metadata.hashed_name()
        ));
    }
    rendered
}

/// Render one ACL as an iptables rule in the policy's sub-chain
///
/// # Arguments
///
/// * `chain` - The policy's sub-chain
/// * `acl` - The ACL to render
fn acl_rule(chain: &str, acl: &AclPolicy) -> String {
    let mut rule = format!("-A {chain}");
    if let Some(protocol) = acl.protocol {
        if protocol != Protocol::Any {
            rule.push_str(&format!(" -p {}", protocol.to_string().to_lowercase()));
        }
    }
    if let Some(ports) = acl.ports {
        match ports.end_port {
            Some(end) => rule.push_str(&format!(" --dport {}:{end}", ports.port)),
            None => rule.push_str(&format!(" --dport {}", ports.port)),
        }
    }
    rule.push_str(&set_matches(&acl.src_list, "src"));
    rule.push_str(&set_matches(&acl.dst_list, "dst"));
    rule.push_str(&format!(" -m comment --comment {}", acl.policy_id));
    let target = match (acl.target, acl.direction) {
        (Verdict::Allowed, Direction::Ingress) => {
            format!("-j {AZURE_NPM_INGRESS_ALLOW_MARK}")
        }
        (Verdict::Allowed, Direction::Egress) => format!("-j {AZURE_NPM_ACCEPT}"),
        (Verdict::Dropped, Direction::Ingress) => {
            format!("-j MARK --set-mark {INGRESS_DROP_MARK}")
        }
        (Verdict::Dropped, Direction::Egress) => {
            format!("-j MARK --set-mark {EGRESS_DROP_MARK}")
        }
    };
    rule.push_str(&format!(" {target}"));
    rule
}

/// Render the jump from a direction chain into the policy's sub-chain
///
/// The jump only fires for traffic hitting the policy's selected pods.
///
/// # Arguments
///
/// * `policy` - The policy to jump into
/// * `chain` - The policy's sub-chain
/// * `direction` - The direction chain to jump from
fn jump_rule(policy: &NpmNetworkPolicy, chain: &str, direction: Direction) -> String {
    let (parent, flag) = match direction {
        Direction::Ingress => (AZURE_NPM_INGRESS, "dst"),
        Direction::Egress => (AZURE_NPM_EGRESS, "src"),
    };
    let mut rule = format!("-A {parent}");
    for meta in policy.selector_metadata() {
        rule.push_str(&format!(" -m set --match-set {} {flag}", meta.hashed_name()));
    }
    rule.push_str(&format!(" -j {chain}"));
    rule
}

/// Build a fresh restore file creator tuned for iptables-restore
///
/// # Arguments
///
/// * `conf` - The Linux dataplane config
fn creator(conf: &LinuxConf) -> Result<FileCreator, Error> {
    let mut creator = FileCreator::new(conf.max_try_count, &[LINE_FAILURE])?;
    // lock contention means the whole file is worth retrying as is
    creator.add_file_level_pattern(XTABLES_LOCK)?;
    Ok(creator)
}

/// The restore args iptables-restore runs under
///
/// # Arguments
///
/// * `conf` - The Linux dataplane config
fn restore_args(conf: &LinuxConf) -> Vec<String> {
    vec![
        "-w".to_owned(),
        conf.lock_timeout.to_string(),
        "--noflush".to_owned(),
    ]
}

/// Install one policy as a single iptables-restore transaction
///
/// # Arguments
///
/// * `runner` - The runner executing iptables-restore
/// * `conf` - The Linux dataplane config
/// * `policy` - The policy to install
pub async fn install(
    runner: &dyn CommandRunner,
    conf: &LinuxConf,
    policy: &NpmNetworkPolicy,
) -> Result<(), Error> {
    let chain = policy_chain(&policy.key());
    let mut creator = creator(conf)?;
    creator.add_line(None, Vec::default(), "*filter");
    // declare and flush only the policy's own chain
    creator.add_line(None, Vec::default(), format!(":{chain} - -"));
    creator.add_line(None, Vec::default(), format!("-F {chain}"));
    for acl in &policy.acls {
        creator.add_line(Some(&chain), Vec::default(), acl_rule(&chain, acl));
    }
    // wire the directions that actually carry rules
    if policy.acls.iter().any(|acl| acl.direction == Direction::Ingress) {
        creator.add_line(Some(&chain), Vec::default(), jump_rule(policy, &chain, Direction::Ingress));
    }
    if policy.acls.iter().any(|acl| acl.direction == Direction::Egress) {
        creator.add_line(Some(&chain), Vec::default(), jump_rule(policy, &chain, Direction::Egress));
    }
    creator.add_line(None, Vec::default(), "COMMIT");
    creator
        .run(runner, &conf.iptables_restore, &restore_args(conf))
        .await?;
    event!(Level::INFO, policy = %policy.key(), chain = %chain, "installed policy chains");
    Ok(())
}

/// Tear down one policy's jumps and flush its sub-chain
///
/// The emptied sub-chain is left behind for the background reconcile to
/// destroy once the kernel has no references to it.
///
/// # Arguments
///
/// * `runner` - The runner executing iptables-restore
/// * `conf` - The Linux dataplane config
/// * `policy` - The policy to tear down
pub async fn remove(
    runner: &dyn CommandRunner,
    conf: &LinuxConf,
    policy: &NpmNetworkPolicy,
) -> Result<String, Error> {
    let chain = policy_chain(&policy.key());
    let mut creator = creator(conf)?;
    creator.add_line(None, Vec::default(), "*filter");
    let tolerate_missing = || -> Result<Vec<ErrorHandler>, Error> {
        Ok(vec![ErrorHandler::new(NO_SUCH_TARGET, LineErrorRule::Continue)?])
    };
    if policy.acls.iter().any(|acl| acl.direction == Direction::Ingress) {
        creator.add_line(
            Some(&chain),
            tolerate_missing()?,
            jump_rule(policy, &chain, Direction::Ingress).replacen("-A ", "-D ", 1),
        );
    }
    if policy.acls.iter().any(|acl| acl.direction == Direction::Egress) {
        creator.add_line(
            Some(&chain),
            tolerate_missing()?,
            jump_rule(policy, &chain, Direction::Egress).replacen("-A ", "-D ", 1),
        );
    }
    creator.add_line(Some(&chain), tolerate_missing()?, format!("-F {chain}"));
    creator.add_line(None, Vec::default(), "COMMIT");
    creator
        .run(runner, &conf.iptables_restore, &restore_args(conf))
        .await?;
    Ok(chain)
}

/// Destroy emptied policy sub-chains in the background reconcile pass
///
/// # Arguments
///
/// * `runner` - The runner executing iptables-restore
/// * `conf` - The Linux dataplane config
/// * `chains` - The sub-chains to destroy
pub async fn destroy_chains(
    runner: &dyn CommandRunner,
    conf: &LinuxConf,
    chains: &[String],
) -> Result<(), Error> {
    if chains.is_empty() {
        return Ok(());
    }
    let mut creator = creator(conf)?;
    creator.add_line(None, Vec::default(), "*filter");
    for chain in chains {
        creator.add_line(
            Some(chain),
            vec![ErrorHandler::new(NO_SUCH_TARGET, LineErrorRule::Continue)?],
            format!("-F {chain}"),
        );
        creator.add_line(
            Some(chain),
            vec![
                ErrorHandler::new(NO_SUCH_TARGET, LineErrorRule::Continue)?,
                // a chain the kernel still references waits for the next pass
                ErrorHandler::new("Directory not empty", LineErrorRule::ContinueAndAbortSection)?,
            ],
            format!("-X {chain}"),
        );
    }
    creator.add_line(None, Vec::default(), "COMMIT");
    creator
        .run(runner, &conf.iptables_restore, &restore_args(conf))
        .await
}

/// Install the base chains and position the FORWARD jump
///
/// # Arguments
///
/// * `runner` - The runner executing iptables
/// * `conf` - The Linux dataplane config
pub async fn bootup(runner: &dyn CommandRunner, conf: &LinuxConf) -> Result<(), Error> {
    // install the five base chains and their plumbing in one transaction
    let mut creator = creator(conf)?;
    creator.add_line(None, Vec::default(), "*filter");
    for chain in base_chains() {
        creator.add_line(None, Vec::default(), format!(":{chain} - -"));
        creator.add_line(None, Vec::default(), format!("-F {chain}"));
    }
    creator.add_line(None, Vec::default(), format!("-A {AZURE_NPM} -j {AZURE_NPM_INGRESS}"));
    creator.add_line(None, Vec::default(), format!("-A {AZURE_NPM} -j {AZURE_NPM_EGRESS}"));
    creator.add_line(
        None,
        Vec::default(),
        format!("-A {AZURE_NPM} -m mark --mark {INGRESS_DROP_MARK} -j DROP"),
    );
    creator.add_line(
        None,
        Vec::default(),
        format!("-A {AZURE_NPM} -m mark --mark {EGRESS_DROP_MARK} -j DROP"),
    );
    creator.add_line(None, Vec::default(), format!("-A {AZURE_NPM} -j {AZURE_NPM_ACCEPT}"));
    creator.add_line(
        None,
        Vec::default(),
        format!("-A {AZURE_NPM_INGRESS_ALLOW_MARK} -j MARK --set-mark {INGRESS_ALLOW_MARK}"),
    );
    creator.add_line(
        None,
        Vec::default(),
        format!("-A {AZURE_NPM_INGRESS_ALLOW_MARK} -j {AZURE_NPM_EGRESS}"),
    );
    creator.add_line(
        None,
        Vec::default(),
        format!("-A {AZURE_NPM_ACCEPT} -j MARK --set-mark {CLEAR_MARK}"),
    );
    creator.add_line(None, Vec::default(), format!("-A {AZURE_NPM_ACCEPT} -j ACCEPT"));
    creator.add_line(None, Vec::default(), "COMMIT");
    creator
        .run(runner, &conf.iptables_restore, &restore_args(conf))
        .await?;
    position_forward_jump(runner, conf).await?;
    // flush and destroy any sub-chains left over from an earlier run
    let leftovers = list_leftover_chains(runner, conf).await?;
    destroy_chains(runner, conf, &leftovers).await?;
    event!(Level::INFO, "installed base chains");
    Ok(())
}

/// The five chains bootup owns
fn base_chains() -> [&'static str; 5] {
    [
        AZURE_NPM,
        AZURE_NPM_INGRESS,
        AZURE_NPM_EGRESS,
        AZURE_NPM_INGRESS_ALLOW_MARK,
        AZURE_NPM_ACCEPT,
    ]
}

/// Make sure the FORWARD jump into AZURE-NPM sits at position 1
///
/// # Arguments
///
/// * `runner` - The runner executing iptables
/// * `conf` - The Linux dataplane config
async fn position_forward_jump(runner: &dyn CommandRunner, conf: &LinuxConf) -> Result<(), Error> {
    let wait = conf.lock_timeout.to_string();
    // find where the jump currently sits if anywhere
    let list = vec![
        "-w".to_owned(),
        wait.clone(),
        "-L".to_owned(),
        "FORWARD".to_owned(),
        "--line-numbers".to_owned(),
        "-n".to_owned(),
    ];
    let out = runner.run(&conf.iptables, &list, "").await?;
    if !out.success() {
        return Err(Error::transient(format!(
            "listing FORWARD failed: {}",
            out.stderr
        )));
    }
    let position = out
        .stdout
        .lines()
        .find(|line| line.contains(AZURE_NPM))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|num| num.parse::<usize>().ok());
    match position {
        // already where we want it
        Some(1) => return Ok(()),
        Some(_) => {
            // a deprecated or drifted jump gets repositioned
            let delete = vec![
                "-w".to_owned(),
                wait.clone(),
                "-D".to_owned(),
                "FORWARD".to_owned(),
                "-j".to_owned(),
                AZURE_NPM.to_owned(),
            ];
            let out = runner.run(&conf.iptables, &delete, "").await?;
            if !out.success() && !out.stderr.contains(NO_SUCH_TARGET) {
                return Err(Error::transient(format!(
                    "removing the drifted FORWARD jump failed: {}",
                    out.stderr
                )));
            }
        }
        None => (),
    }
    let insert = vec![
        "-w".to_owned(),
        wait,
        "-I".to_owned(),
        "FORWARD".to_owned(),
        "1".to_owned(),
        "-j".to_owned(),
        AZURE_NPM.to_owned(),
    ];
    let out = runner.run(&conf.iptables, &insert, "").await?;
    if !out.success() {
        return Err(Error::transient(format!(
            "inserting the FORWARD jump failed: {}",
            out.stderr
        )));
    }
    Ok(())
}

/// List leftover policy sub-chains from an earlier run
///
/// # Arguments
///
/// * `runner` - The runner executing iptables
/// * `conf` - The Linux dataplane config
async fn list_leftover_chains(
    runner: &dyn CommandRunner,
    conf: &LinuxConf,
) -> Result<Vec<String>, Error> {
    let args = vec![
        "-w".to_owned(),
        conf.lock_timeout.to_string(),
        "-S".to_owned(),
    ];
    let out = runner.run(&conf.iptables, &args, "").await?;
    if !out.success() {
        return Err(Error::transient(format!(
            "listing chains failed: {}",
            out.stderr
        )));
    }
    let base = base_chains();
    let leftovers = out
        .stdout
        .lines()
        .filter_map(|line| line.strip_prefix("-N "))
        .map(str::trim)
        .filter(|chain| chain.starts_with("AZURE-NPM-"))
        .filter(|chain| !base.contains(chain))
        .map(ToOwned::to_owned)
        .collect();
    Ok(leftovers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::{IpSetMetadata, Ports, SetType, TranslatedIpSet};

    /// Build a one acl policy for tests
    fn policy(target: Verdict, direction: Direction) -> NpmNetworkPolicy {
        let selector = IpSetMetadata::new("k1:v1", SetType::KeyValueLabelOfPod);
        let mut acl = AclPolicy::new("azure-acl-x-base", target, direction);
        acl.protocol = Some(Protocol::Tcp);
        acl.ports = Some(Ports::single(8080));
        acl.src_list = vec![SetInfo::included(IpSetMetadata::new("y", SetType::Namespace))];
        NpmNetworkPolicy {
            namespace: "x".to_owned(),
            name: "base".to_owned(),
            pod_selector_ipsets: vec![TranslatedIpSet::new(selector)],
            acls: vec![acl],
            ..NpmNetworkPolicy::default()
        }
    }

    #[test]
    fn policy_chains_are_stable_and_distinct() {
        let first = policy_chain("x/base");
        assert!(first.starts_with("AZURE-NPM-"));
        assert_eq!(first, policy_chain("x/base"));
        assert_ne!(first, policy_chain("x/other"));
    }

    #[test]
    fn acl_rules_carry_matches_and_verdicts() {
        let policy = policy(Verdict::Allowed, Direction::Ingress);
        let rule = acl_rule("AZURE-NPM-abc", &policy.acls[0]);
        assert!(rule.starts_with("-A AZURE-NPM-abc"));
        assert!(rule.contains("-p tcp"));
        assert!(rule.contains("--dport 8080"));
        assert!(rule.contains("--match-set"));
        assert!(rule.contains(" src"));
        assert!(rule.ends_with(&format!("-j {AZURE_NPM_INGRESS_ALLOW_MARK}")));
        // drops set the direction's mark bit instead
        let dropped = self::policy(Verdict::Dropped, Direction::Egress);
        let rule = acl_rule("AZURE-NPM-abc", &dropped.acls[0]);
        assert!(rule.ends_with(&format!("-j MARK --set-mark {EGRESS_DROP_MARK}")));
    }

    #[test]
    fn jump_rules_match_the_selector() {
        let policy = policy(Verdict::Allowed, Direction::Ingress);
        let chain = policy_chain(&policy.key());
        let jump = jump_rule(&policy, &chain, Direction::Ingress);
        assert!(jump.starts_with(&format!("-A {AZURE_NPM_INGRESS}")));
        assert!(jump.contains(" dst"));
        assert!(jump.ends_with(&format!("-j {chain}")));
        let jump = jump_rule(&policy, &chain, Direction::Egress);
        assert!(jump.contains(" src"));
    }
}
