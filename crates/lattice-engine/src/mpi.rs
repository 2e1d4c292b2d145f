use lattice_core::config::{LocalLauncherConfig, MpiFlavor};

use crate::port::is_local_host;

/// Split `num_workers` over `hosts` as evenly as possible; the first hosts take
/// the remainder. Hosts that would receive no worker are left out.
pub fn distribute_slots(hosts: &[String], num_workers: usize) -> Vec<(String, usize)> {
    if hosts.is_empty() {
        return Vec::new();
    }
    let base = num_workers / hosts.len();
    let extra = num_workers % hosts.len();

    hosts
        .iter()
        .enumerate()
        .map(|(i, host)| (host.clone(), base + usize::from(i < extra)))
        .filter(|(_, slots)| *slots > 0)
        .collect()
}

/// Flavor actually used once `Auto` is resolved against the deployment.
pub fn effective_flavor(config: &LocalLauncherConfig) -> MpiFlavor {
    match config.mpi {
        MpiFlavor::Auto => {
            let single_local = config.num_workers == 1
                && config.hosts.len() == 1
                && is_local_host(&config.hosts[0]);
            if single_local {
                MpiFlavor::None
            } else {
                MpiFlavor::OpenMpi
            }
        }
        flavor => flavor,
    }
}

/// Command prefix that starts `num_workers` engine processes across the
/// configured hosts. Empty when the binary is exec'd directly.
pub fn resolve_prefix(config: &LocalLauncherConfig) -> Vec<String> {
    let slots = distribute_slots(&config.hosts, config.num_workers);
    let workers = config.num_workers.to_string();

    match effective_flavor(config) {
        MpiFlavor::OpenMpi => vec![
            config.mpirun.clone(),
            "--allow-run-as-root".to_string(),
            "-n".to_string(),
            workers,
            "-host".to_string(),
            slots
                .iter()
                .map(|(host, n)| format!("{}:{}", host, n))
                .collect::<Vec<_>>()
                .join(","),
        ],
        // MPICH's -hosts takes bare names and spreads -n over them itself.
        MpiFlavor::Mpich => vec![
            config.mpirun.clone(),
            "-n".to_string(),
            workers,
            "-hosts".to_string(),
            slots
                .iter()
                .map(|(host, _)| host.as_str())
                .collect::<Vec<_>>()
                .join(","),
        ],
        MpiFlavor::None | MpiFlavor::Auto => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn slots_spread_remainder_to_first_hosts() {
        let slots = distribute_slots(&hosts(&["a", "b", "c"]), 5);
        assert_eq!(
            slots,
            vec![("a".into(), 2), ("b".into(), 2), ("c".into(), 1)]
        );
    }

    #[test]
    fn idle_hosts_are_dropped() {
        let slots = distribute_slots(&hosts(&["a", "b", "c"]), 2);
        assert_eq!(slots, vec![("a".into(), 1), ("b".into(), 1)]);
        assert!(distribute_slots(&[], 4).is_empty());
    }

    #[test]
    fn auto_execs_single_local_worker_directly() {
        let config = LocalLauncherConfig::new("grape_engine");
        assert_eq!(effective_flavor(&config), MpiFlavor::None);
        assert!(resolve_prefix(&config).is_empty());
    }

    #[test]
    fn auto_uses_openmpi_for_many_workers() {
        let mut config = LocalLauncherConfig::new("grape_engine");
        config.num_workers = 4;
        config.hosts = hosts(&["node-a", "node-b"]);
        assert_eq!(
            resolve_prefix(&config),
            vec![
                "mpirun",
                "--allow-run-as-root",
                "-n",
                "4",
                "-host",
                "node-a:2,node-b:2"
            ]
        );
    }

    #[test]
    fn mpich_prefix() {
        let mut config = LocalLauncherConfig::new("grape_engine");
        config.mpi = MpiFlavor::Mpich;
        config.mpirun = "/opt/mpich/bin/mpirun".into();
        config.num_workers = 3;
        assert_eq!(
            resolve_prefix(&config),
            vec!["/opt/mpich/bin/mpirun", "-n", "3", "-hosts", "localhost"]
        );
    }

    #[test]
    fn mpich_hosts_are_bare_names() {
        let mut config = LocalLauncherConfig::new("grape_engine");
        config.mpi = MpiFlavor::Mpich;
        config.num_workers = 3;
        config.hosts = hosts(&["node-a", "node-b", "node-c", "node-d"]);
        assert_eq!(
            resolve_prefix(&config),
            vec!["mpirun", "-n", "3", "-hosts", "node-a,node-b,node-c"]
        );
    }

    #[test]
    fn explicit_none_skips_prefix_even_for_many_workers() {
        let mut config = LocalLauncherConfig::new("grape_engine");
        config.mpi = MpiFlavor::None;
        config.num_workers = 8;
        assert!(resolve_prefix(&config).is_empty());
    }
}
