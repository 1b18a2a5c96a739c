use crate::{options::Options, protocols::Protocol};
use anyhow::{anyhow, Context};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs::OpenOptions,
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr},
    path::Path,
};
use svclb_common::{
    Algorithm, BackendState, Features, LbConfig, Selection, DEFAULT_LOOPBACK_IPV4, MAGLEV_LUT_SIZE,
    MAX_BACKENDS, MAX_SERVICES,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    SessionAffinity,
    SrcRangeCheck,
    LocalRedirect,
    LoopbackLb,
    L7Lb,
    NoBackendResponse,
}

impl From<FeatureName> for Features {
    fn from(f: FeatureName) -> Self {
        match f {
            FeatureName::SessionAffinity => Features::SESSION_AFFINITY,
            FeatureName::SrcRangeCheck => Features::SRC_RANGE_CHECK,
            FeatureName::LocalRedirect => Features::LOCAL_REDIRECT,
            FeatureName::LoopbackLb => Features::LOOPBACK_LB,
            FeatureName::L7Lb => Features::L7_LB,
            FeatureName::NoBackendResponse => Features::NO_BACKEND_RESPONSE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmName {
    #[default]
    Random,
    Maglev,
    First,
}

impl From<AlgorithmName> for Algorithm {
    fn from(a: AlgorithmName) -> Self {
        match a {
            AlgorithmName::Random => Algorithm::Random,
            AlgorithmName::Maglev => Algorithm::Maglev,
            AlgorithmName::First => Algorithm::First,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionName {
    #[default]
    Random,
    Maglev,
    First,
    PerService,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateName {
    #[default]
    Active,
    Terminating,
    Quarantined,
    Maintenance,
}

impl From<StateName> for BackendState {
    fn from(s: StateName) -> Self {
        match s {
            StateName::Active => BackendState::Active,
            StateName::Terminating => BackendState::Terminating,
            StateName::Quarantined => BackendState::Quarantined,
            StateName::Maintenance => BackendState::Maintenance,
        }
    }
}

fn default_features() -> Vec<FeatureName> {
    vec![
        FeatureName::SessionAffinity,
        FeatureName::SrcRangeCheck,
        FeatureName::LocalRedirect,
        FeatureName::LoopbackLb,
        FeatureName::L7Lb,
        FeatureName::NoBackendResponse,
    ]
}

fn default_maglev_size() -> u32 {
    MAGLEV_LUT_SIZE
}

fn default_loopback() -> Ipv4Addr {
    DEFAULT_LOOPBACK_IPV4
}

fn default_weight() -> u16 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Datapath {
    #[serde(default = "default_features")]
    pub features: Vec<FeatureName>,
    #[serde(default)]
    pub selection: SelectionName,
    #[serde(default = "default_maglev_size")]
    pub maglev_table_size: u32,
    #[serde(default = "default_loopback")]
    pub loopback_ipv4: Ipv4Addr,
    /// Addresses of endpoints hosted on this node
    #[serde(default)]
    pub local_endpoints: Vec<IpAddr>,
}

impl Default for Datapath {
    fn default() -> Self {
        Self {
            features: default_features(),
            selection: SelectionName::default(),
            maglev_table_size: default_maglev_size(),
            loopback_ipv4: default_loopback(),
            local_endpoints: vec![],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendCfg {
    pub address: IpAddr,
    /// Zero keeps the service port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub state: StateName,
    #[serde(default = "default_weight")]
    pub weight: u16,
    #[serde(default)]
    pub zone: u8,
    #[serde(default)]
    pub cluster_id: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceCfg {
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub backends: Vec<String>,
    /// Backends used at the internal scope, set for two scope services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_backends: Option<Vec<String>>,
    #[serde(default)]
    pub algorithm: AlgorithmName,
    /// Session affinity timeout in seconds, zero disables affinity
    #[serde(default)]
    pub affinity_timeout: u32,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub source_ranges: Vec<IpNet>,
}

impl ServiceCfg {
    pub fn options(&self) -> Options {
        Options::from_option_args(&self.options)
    }
}

/// Namespace that must reach a frontend untranslated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkipCfg {
    pub netns_cookie: u64,
    pub address: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub datapath: Datapath,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendCfg>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceCfg>,
    #[serde(default)]
    pub skip_lb: Vec<SkipCfg>,
}

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2u32;
    while (i as u64) * (i as u64) <= n as u64 {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

impl Config {
    pub fn description(&self) -> String {
        let v4 = self
            .services
            .values()
            .filter(|s| s.address.is_ipv4())
            .count();
        format!(
            "Services: {} ({} ipv4, {} ipv6), backends: {}, skip entries: {}",
            self.services.len(),
            v4,
            self.services.len() - v4,
            self.backends.len(),
            self.skip_lb.len()
        )
    }

    pub fn lb_config(&self) -> LbConfig {
        let features = self
            .datapath
            .features
            .iter()
            .fold(Features::empty(), |acc, f| acc | Features::from(*f));
        let selection = match self.datapath.selection {
            SelectionName::Random => Selection::Fixed(Algorithm::Random),
            SelectionName::Maglev => Selection::Fixed(Algorithm::Maglev),
            SelectionName::First => Selection::Fixed(Algorithm::First),
            SelectionName::PerService => Selection::PerService,
        };
        LbConfig {
            features,
            selection,
            maglev_lut_size: self.datapath.maglev_table_size,
            loopback_ipv4: self.datapath.loopback_ipv4,
        }
    }

    /// Checks references, address families and table limits.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let size = self.datapath.maglev_table_size;
        if !is_prime(size) {
            return Err(anyhow!("Maglev table size {} is not a prime number", size));
        }
        if self.backends.len() >= MAX_BACKENDS as usize {
            return Err(anyhow!("Too many backends: {}", self.backends.len()));
        }
        if self.services.len() >= MAX_SERVICES as usize {
            return Err(anyhow!("Too many services: {}", self.services.len()));
        }

        for (name, be) in &self.backends {
            if be.weight == 0 {
                return Err(anyhow!("Backend {} has zero weight", name));
            }
        }

        let mut frontends = HashSet::new();
        for (name, svc) in &self.services {
            if !svc.protocol.is_balanced() {
                return Err(anyhow!(
                    "Service {} uses protocol {} which can't be load balanced",
                    name,
                    svc.protocol
                ));
            }
            if !frontends.insert((svc.address, svc.port, svc.protocol)) {
                return Err(anyhow!(
                    "Service {} duplicates frontend [{}]:{}",
                    name,
                    svc.address,
                    svc.port
                ));
            }

            let internal = svc.internal_backends.iter().flatten();
            for be_name in svc.backends.iter().chain(internal) {
                let be = self.backends.get(be_name).ok_or(anyhow!(
                    "Service {} refers to unknown backend {}",
                    name,
                    be_name
                ))?;
                if be.address.is_ipv4() != svc.address.is_ipv4() {
                    return Err(anyhow!(
                        "Service {} and backend {} have different address families",
                        name,
                        be_name
                    ));
                }
            }
            if svc.backends.len() >= u16::MAX as usize {
                return Err(anyhow!("Service {} has too many backends", name));
            }

            for net in &svc.source_ranges {
                if net.addr().is_ipv4() != svc.address.is_ipv4() {
                    return Err(anyhow!(
                        "Service {} source range {} has a different address family",
                        name,
                        net
                    ));
                }
            }
        }

        Ok(())
    }
}

pub struct ConfigFile {
    path: String,
}

impl ConfigFile {
    pub fn new<S: AsRef<str>>(filename: &S) -> Self {
        Self {
            path: String::from(filename.as_ref()),
        }
    }

    pub fn load(&self) -> Result<Config, anyhow::Error> {
        if !Path::new(&self.path).try_exists()? {
            return Err(anyhow!("Config file does not exist, {}", self.path));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .context(format!("Can't read config file: {}", self.path))?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents)?;

        log::info!("Read {} bytes from: {}", size, self.path);

        let cfg: Config = toml::from_str(&contents)
            .context(format!("Can't parse config file: {}", self.path))?;
        cfg.validate()
            .context(format!("Invalid config file: {}", self.path))?;

        log::info!("Found in config: {}", cfg.description());
        Ok(cfg)
    }

    pub fn save(&self, cfg: &Config) -> Result<(), anyhow::Error> {
        if Path::new(&self.path).try_exists()? {
            log::info!("Config file will be overridden, {}", self.path);
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .context(format!("Can't write to config file: {}", self.path))?;

        log::info!("Saving config: {}", cfg.description());

        let contents = toml::to_string(cfg)?;

        file.write_all(contents.as_bytes())?;

        log::info!(
            "Wrote {} bytes to config file: {}",
            contents.len(),
            self.path
        );

        Ok(())
    }
}
