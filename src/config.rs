use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use crate::endpoint::Endpoint;
use crate::security::SecureKeyManager;

pub const DEFAULT_LISTEN_PORT: u16 = 48138;
pub const DEFAULT_STATUS_PORT: u16 = 48139;
const MAX_NUM_SERVERS: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerKind {
    RoundRobin,
    UniformRandom,
    LeastUsed,
}

impl FromStr for LoadBalancerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RoundRobin" => Ok(LoadBalancerKind::RoundRobin),
            "UniformRandom" => Ok(LoadBalancerKind::UniformRandom),
            "LeastUsed" => Ok(LoadBalancerKind::LeastUsed),
            other => Err(anyhow!(
                "'{}' is not a load balancer (expected RoundRobin, LeastUsed, or UniformRandom)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JumpHostConfig {
    pub sshd: Endpoint,
    pub target_server: Endpoint,
    pub user: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub compression: bool,
    pub ciphers: Option<String>,
    pub ssh_binary: Option<String>,
    pub open_all_interfaces: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub status_port: u16,
    pub upstreams: Vec<Endpoint>,
    pub load_balancer: LoadBalancerKind,
    pub jump_host: Option<JumpHostConfig>,
    pub verbose: bool,
}

// Raw CLI surface. Parsed with clap, then cross-validated by
// ProxyConfig::from_args, chaining anyhow::Context across each
// validation step.
#[derive(Parser, Debug)]
#[command(name = "tcp-lb-proxy", about = "TCP-level load-balancing proxy")]
pub struct Args {
    /// Listening port
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_LISTEN_PORT)]
    pub port: u16,

    /// Status HTTP port
    #[arg(short = 'w', long = "webstatus_port", default_value_t = DEFAULT_STATUS_PORT)]
    pub webstatus_port: u16,

    /// Space-separated upstream list, each host:port
    #[arg(short = 's', long = "servers", num_args = 1.., value_delimiter = ' ')]
    pub servers: Option<Vec<String>>,

    /// Use localhost:48139+i for i in [0, N); max 22
    #[arg(short = 'n', long = "num_servers")]
    pub num_servers: Option<u32>,

    /// RoundRobin | LeastUsed | UniformRandom
    #[arg(short = 'b', long = "load_balancer", default_value = "RoundRobin")]
    pub load_balancer: String,

    /// SSH jump host, HOST or HOST:PORT
    #[arg(short = 'j', long = "jumphost")]
    pub jumphost: Option<String>,

    /// Target server reachable through the jump host, HOST:PORT
    #[arg(short = 'y', long = "jumphost_server")]
    pub jumphost_server: Option<String>,

    /// SSH user for the jump host
    #[arg(short = 'u', long = "jumphost_user")]
    pub jumphost_user: Option<String>,

    /// SSH -i credentials file
    #[arg(short = 'i', long = "jumphost_credentials")]
    pub jumphost_credentials: Option<PathBuf>,

    /// Add SSH -C (compression)
    #[arg(short = 'C', long = "jumphost_compression")]
    pub jumphost_compression: bool,

    /// SSH -c cipher spec
    #[arg(short = 'c', long = "jumphost_ciphers")]
    pub jumphost_ciphers: Option<String>,

    /// Alternative ssh binary
    #[arg(long = "ssh_binary")]
    pub ssh_binary: Option<String>,

    /// Bind the local forward to *:PORT instead of localhost
    #[arg(short = 'o', long = "openInterfaces")]
    pub open_interfaces: bool,

    /// Debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl ProxyConfig {
    // Parses std::env::args() and validates the result. Any failure,
    // clap syntax error or a cross-flag validation rule, is returned as
    // an anyhow::Error; main turns that into exit code 1.
    pub fn from_env() -> Result<Self> {
        let args = Args::try_parse().map_err(|e| anyhow!("{}", e))?;
        Self::from_args(args)
    }

    pub fn from_args(args: Args) -> Result<Self> {
        if args.servers.is_some() && args.num_servers.is_some() {
            bail!("--servers and --num_servers are mutually exclusive");
        }
        if args.servers.is_none() && args.num_servers.is_none() {
            bail!("one of --servers or --num_servers is required");
        }

        let jumphost_flags_used = args.jumphost_user.is_some()
            || args.jumphost_credentials.is_some()
            || args.jumphost_compression
            || args.jumphost_ciphers.is_some()
            || args.ssh_binary.is_some()
            || args.jumphost_server.is_some();
        if jumphost_flags_used && args.jumphost.is_none() {
            bail!("--jumphost_user/--jumphost_credentials/--jumphost_compression/--jumphost_ciphers/--ssh_binary/--jumphost_server require --jumphost");
        }

        let jump_host = match &args.jumphost {
            None => None,
            Some(jh) => {
                let sshd = Endpoint::parse_jumphost(jh)
                    .with_context(|| format!("invalid --jumphost '{}'", jh))?;
                let target_server_str = args
                    .jumphost_server
                    .as_deref()
                    .ok_or_else(|| anyhow!("--jumphost requires --jumphost_server"))?;
                let target_server = Endpoint::parse_host_port(target_server_str)
                    .context("invalid --jumphost_server")?;
                if target_server.is_unspecified_port() {
                    bail!("--jumphost_server must specify a port");
                }
                SecureKeyManager::sanitize_ssh_args(
                    &sshd.host,
                    args.jumphost_user.as_deref().unwrap_or(""),
                )
                .context("jump host configuration validation failed")?;
                if let Some(creds) = &args.jumphost_credentials {
                    SecureKeyManager::validate_key_security(creds)
                        .context("--jumphost_credentials validation failed")?;
                }
                Some(JumpHostConfig {
                    sshd,
                    target_server,
                    user: args.jumphost_user.clone(),
                    credentials_file: args.jumphost_credentials.clone(),
                    compression: args.jumphost_compression,
                    ciphers: args.jumphost_ciphers.clone(),
                    ssh_binary: args.ssh_binary.clone(),
                    open_all_interfaces: args.open_interfaces,
                })
            }
        };

        let upstreams = if let Some(servers) = &args.servers {
            servers
                .iter()
                .map(|s| {
                    let ep = Endpoint::parse_host_port(s)
                        .with_context(|| format!("invalid server '{}'", s))?;
                    if ep.is_unspecified_port() {
                        bail!("server '{}' must specify a port", s);
                    }
                    Ok(ep)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            let n = args.num_servers.unwrap();
            if n > MAX_NUM_SERVERS {
                bail!("--num_servers must be <= {} (got {})", MAX_NUM_SERVERS, n);
            }
            (0..n)
                .map(|i| Endpoint::new("localhost", DEFAULT_STATUS_PORT as i32 + i as i32))
                .collect()
        };

        if upstreams.is_empty() {
            bail!("at least one upstream is required");
        }

        let load_balancer = args
            .load_balancer
            .parse()
            .context("invalid --load_balancer")?;

        Ok(ProxyConfig {
            listen_port: args.port,
            status_port: args.webstatus_port,
            upstreams,
            load_balancer,
            jump_host,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            port: DEFAULT_LISTEN_PORT,
            webstatus_port: DEFAULT_STATUS_PORT,
            servers: None,
            num_servers: None,
            load_balancer: "RoundRobin".to_string(),
            jumphost: None,
            jumphost_server: None,
            jumphost_user: None,
            jumphost_credentials: None,
            jumphost_compression: false,
            jumphost_ciphers: None,
            ssh_binary: None,
            open_interfaces: false,
            verbose: false,
        }
    }

    #[test]
    fn requires_servers_or_num_servers() {
        let args = base_args();
        assert!(ProxyConfig::from_args(args).is_err());
    }

    #[test]
    fn servers_and_num_servers_are_exclusive() {
        let mut args = base_args();
        args.servers = Some(vec!["localhost:1".to_string()]);
        args.num_servers = Some(2);
        assert!(ProxyConfig::from_args(args).is_err());
    }

    #[test]
    fn num_servers_22_accepted_23_rejected() {
        let mut args = base_args();
        args.num_servers = Some(22);
        assert!(ProxyConfig::from_args(args).is_ok());

        let mut args = base_args();
        args.num_servers = Some(23);
        assert!(ProxyConfig::from_args(args).is_err());
    }

    #[test]
    fn num_servers_generates_expected_endpoints() {
        let mut args = base_args();
        args.num_servers = Some(3);
        let cfg = ProxyConfig::from_args(args).unwrap();
        assert_eq!(
            cfg.upstreams,
            vec![
                Endpoint::new("localhost", 48139),
                Endpoint::new("localhost", 48140),
                Endpoint::new("localhost", 48141),
            ]
        );
    }

    #[test]
    fn jumphost_flags_require_jumphost() {
        let mut args = base_args();
        args.servers = Some(vec!["localhost:1".to_string()]);
        args.jumphost_compression = true;
        assert!(ProxyConfig::from_args(args).is_err());
    }

    #[test]
    fn jumphost_requires_jumphost_server() {
        let mut args = base_args();
        args.servers = Some(vec!["localhost:1".to_string()]);
        args.jumphost = Some("bastion".to_string());
        assert!(ProxyConfig::from_args(args).is_err());
    }

    #[test]
    fn jumphost_server_rejects_unspecified_port() {
        let mut args = base_args();
        args.servers = Some(vec!["localhost:1".to_string()]);
        args.jumphost = Some("bastion".to_string());
        args.jumphost_server = Some("target".to_string());
        assert!(ProxyConfig::from_args(args).is_err());
    }

    #[test]
    fn valid_jumphost_config_parses() {
        let mut args = base_args();
        args.servers = Some(vec!["localhost:1".to_string()]);
        args.jumphost = Some("bastion".to_string());
        args.jumphost_server = Some("internal:80".to_string());
        let cfg = ProxyConfig::from_args(args).unwrap();
        let jh = cfg.jump_host.unwrap();
        assert_eq!(jh.sshd.port, -1);
        assert_eq!(jh.target_server, Endpoint::new("internal", 80));
    }

    #[test]
    fn load_balancer_kind_parses() {
        assert_eq!(
            "LeastUsed".parse::<LoadBalancerKind>().unwrap(),
            LoadBalancerKind::LeastUsed
        );
        assert!("Bogus".parse::<LoadBalancerKind>().is_err());
    }
}
