use std::{collections::BTreeMap, fmt};
use svclb_common::SvcFlags;

pub const NODEPORT: &str = "nodeport";
pub const EXTERNAL_IP: &str = "external_ip";
pub const HOSTPORT: &str = "hostport";
pub const LOOPBACK: &str = "loopback";
pub const LOCAL_REDIRECT: &str = "local_redirect";
pub const L7_DELEGATE: &str = "l7_delegate";
pub const ROUTABLE: &str = "routable";
pub const LOADBALANCER: &str = "loadbalancer";
pub const SOURCE_RANGE_DENY: &str = "deny_source_ranges";
pub const L7_PROXY_PORT: &str = "l7_proxy_port";

/// Service options given as `flag` or `key=value` strings.
#[derive(Clone, Default, Debug)]
pub struct Options {
    pub props: BTreeMap<String, String>,
    pub flags: SvcFlags,
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_options().join(" "))
    }
}

impl Options {
    pub fn to_options(&self) -> Vec<String> {
        let mut opt = vec![];
        for flag in self.flags {
            let name = match flag {
                SvcFlags::NODEPORT => NODEPORT,
                SvcFlags::EXTERNAL_IP => EXTERNAL_IP,
                SvcFlags::HOSTPORT => HOSTPORT,
                SvcFlags::LOOPBACK => LOOPBACK,
                SvcFlags::LOCAL_REDIRECT => LOCAL_REDIRECT,
                SvcFlags::L7_DELEGATE => L7_DELEGATE,
                SvcFlags::ROUTABLE => ROUTABLE,
                SvcFlags::LOADBALANCER => LOADBALANCER,
                SvcFlags::SOURCE_RANGE_DENY => SOURCE_RANGE_DENY,
                _ => continue,
            };
            opt.push(name.to_string());
        }
        for (k, v) in &self.props {
            opt.push(format!("{}={}", k, v));
        }
        opt
    }

    pub fn new(flags: SvcFlags) -> Self {
        Self {
            props: BTreeMap::new(),
            flags,
        }
    }

    pub fn from_option_args(args: &[String]) -> Self {
        let mut props = BTreeMap::new();
        let mut flags = SvcFlags::empty();

        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                match arg.as_str() {
                    NODEPORT => flags.insert(SvcFlags::NODEPORT),
                    EXTERNAL_IP => flags.insert(SvcFlags::EXTERNAL_IP),
                    HOSTPORT => flags.insert(SvcFlags::HOSTPORT),
                    LOOPBACK => flags.insert(SvcFlags::LOOPBACK),
                    LOCAL_REDIRECT => flags.insert(SvcFlags::LOCAL_REDIRECT),
                    L7_DELEGATE => flags.insert(SvcFlags::L7_DELEGATE),
                    ROUTABLE => flags.insert(SvcFlags::ROUTABLE),
                    LOADBALANCER | "lb" => flags.insert(SvcFlags::LOADBALANCER),
                    SOURCE_RANGE_DENY | "deny" => flags.insert(SvcFlags::SOURCE_RANGE_DENY),
                    _ => log::error!("Unknown flag '{}' ", arg),
                }
                continue;
            };
            match key {
                L7_PROXY_PORT => match value.parse::<u16>() {
                    Ok(port) if port > 0 => {
                        flags.insert(SvcFlags::L7_LOADBALANCER);
                        props.insert(key.to_string(), value.to_string());
                    }
                    _ => log::error!("Invalid proxy port '{}', see option '{}'", value, arg),
                },
                _ => log::error!("Unknown key '{}' in option '{}'", key, arg),
            };
        }
        Self { props, flags }
    }

    pub fn l7_proxy_port(&self) -> u16 {
        self.props
            .get(L7_PROXY_PORT)
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or_default()
    }
}
