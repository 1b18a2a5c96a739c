//! Populates the directory from the configuration. Backend ids and reverse
//! NAT indices follow the name order of the configuration tables, internal
//! scope frontends get indices after all services.

use crate::{
    backends::{EndPoint, ToEndPoint},
    config::{BackendCfg, Config, ServiceCfg},
    directory::{Directory, FamilyTables, ServiceTables},
    info::InfoTable,
    maglev::{self, MaglevBackend},
    options::Options,
};
use anyhow::anyhow;
use log::{debug, info};
use std::{collections::BTreeMap, net::IpAddr};
use svclb_common::{
    Algorithm, Backend, BackendState, LbConfig, RevNat, Scope, Selection, Service,
    SkipKey, SvcFlags, SvcKey,
};

/// Frontend as installed in the directory.
#[derive(Clone, Debug)]
pub struct Frontend {
    pub scope: Scope,
    pub rev_nat_index: u16,
    pub backends: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct ServiceEntry {
    pub name: String,
    pub endpoint: EndPoint,
    pub flags: SvcFlags,
    pub algorithm: Algorithm,
    pub frontends: Vec<Frontend>,
}

/// Names and ids assigned while populating the directory.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub backends: BTreeMap<String, u32>,
    pub services: Vec<ServiceEntry>,
}

impl Catalog {
    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn backend_name(&self, id: u32) -> Option<&str> {
        self.backends
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }
}

fn needs_maglev(lb: &LbConfig, algorithm: Algorithm) -> bool {
    match lb.selection {
        Selection::Fixed(alg) => alg == Algorithm::Maglev,
        Selection::PerService => algorithm == Algorithm::Maglev,
    }
}

fn to_backend<A: FamilyTables>(address: A, be: &BackendCfg) -> Backend<A> {
    Backend {
        state: BackendState::from(be.state),
        zone: be.zone,
        cluster_id: be.cluster_id,
        ..Backend::new(address, be.port, be.protocol as u8)
    }
}

struct ServiceSpec<'a> {
    address: IpAddr,
    port: u16,
    proto: u8,
    template: Service,
    cfg: &'a ServiceCfg,
}

struct Installer<'a> {
    cfg: &'a Config,
    lb: LbConfig,
    ids: &'a BTreeMap<String, u32>,
}

impl Installer<'_> {
    fn resolve(&self, names: &[String]) -> Result<Vec<(u32, &BackendCfg)>, anyhow::Error> {
        names
            .iter()
            .map(|name| {
                let id = self
                    .ids
                    .get(name)
                    .ok_or(anyhow!("Unknown backend {}", name))?;
                let be = self
                    .cfg
                    .backends
                    .get(name)
                    .ok_or(anyhow!("Unknown backend {}", name))?;
                Ok((*id, be))
            })
            .collect()
    }

    fn install<A: FamilyTables>(
        &self,
        tables: &ServiceTables<A>,
        spec: &ServiceSpec,
        scope: Scope,
        rev_nat_index: u16,
        names: &[String],
    ) -> Result<Frontend, anyhow::Error> {
        let address = A::from_ip(&spec.address)
            .ok_or(anyhow!("Address family mismatch for {}", spec.address))?;
        let key = SvcKey::new(address, spec.port, spec.proto).with_scope(scope);
        let backends = self.resolve(names)?;

        let svc = Service {
            count: backends.len() as u16,
            rev_nat_index,
            ..spec.template
        };
        tables.insert_service(key, svc);
        for (slot, (id, _)) in backends.iter().enumerate() {
            tables.insert_service(key.with_slot(slot as u16 + 1), Service::slot(*id, rev_nat_index));
            tables.insert_affinity_match(rev_nat_index, *id);
        }
        tables.insert_rev_nat(
            rev_nat_index,
            RevNat {
                address,
                port: key.dport,
            },
        );

        for net in &spec.cfg.source_ranges {
            let prefix = A::from_ip(&net.addr())
                .ok_or(anyhow!("Address family mismatch for source range {}", net))?;
            tables.insert_src_range(rev_nat_index, prefix, net.prefix_len());
        }

        if needs_maglev(&self.lb, svc.algorithm) {
            let list = backends
                .iter()
                .map(|(id, be)| {
                    MaglevBackend::new(*id, be.weight, format!("{}:{}", be.address, be.port))
                })
                .collect::<Vec<_>>();
            tables.set_maglev(
                rev_nat_index,
                maglev::build_table(&list, self.lb.maglev_lut_size),
            );
        }

        debug!(
            "[svc] installed [{}]:{} scope {:?} rev nat {} with {} backends",
            address,
            key.dport,
            scope,
            rev_nat_index,
            backends.len()
        );

        Ok(Frontend {
            scope,
            rev_nat_index,
            backends: backends.iter().map(|(id, _)| *id).collect(),
        })
    }

    fn install_service<A: FamilyTables>(
        &self,
        dir: &Directory,
        spec: &ServiceSpec,
        rev_nat_index: u16,
        internal_index: &mut u16,
    ) -> Result<Vec<Frontend>, anyhow::Error> {
        let tables = A::tables(dir);
        let mut frontends = vec![self.install(
            tables,
            spec,
            Scope::External,
            rev_nat_index,
            &spec.cfg.backends,
        )?];

        if let Some(internal) = &spec.cfg.internal_backends {
            *internal_index = internal_index
                .checked_add(1)
                .ok_or(anyhow!("Out of reverse NAT indices"))?;
            frontends.push(self.install(tables, spec, Scope::Internal, *internal_index, internal)?);
        }
        Ok(frontends)
    }
}

fn service_flags(svc: &ServiceCfg, opts: &Options) -> SvcFlags {
    let mut flags = opts.flags;
    if svc.affinity_timeout > 0 {
        flags.insert(SvcFlags::AFFINITY);
    }
    if !svc.source_ranges.is_empty() {
        flags.insert(SvcFlags::SOURCE_RANGE);
    }
    if svc.internal_backends.is_some() {
        flags.insert(SvcFlags::TWO_SCOPES);
    }
    flags
}

/// Installs every backend, service and skip entry of `cfg` into `dir`.
pub fn populate(cfg: &Config, dir: &Directory) -> Result<Catalog, anyhow::Error> {
    let mut catalog = Catalog::default();

    for (i, (name, be)) in cfg.backends.iter().enumerate() {
        let id = i as u32 + 1;
        match be.address {
            IpAddr::V4(ip) => dir.v4.insert_backend(id, to_backend(ip, be)),
            IpAddr::V6(ip) => dir.v6.insert_backend(id, to_backend(ip, be)),
        }
        catalog.backends.insert(name.clone(), id);
    }

    let installer = Installer {
        cfg,
        lb: cfg.lb_config(),
        ids: &catalog.backends,
    };

    let mut services = vec![];
    let mut internal_index = u16::try_from(cfg.services.len())
        .map_err(|_| anyhow!("Too many services: {}", cfg.services.len()))?;
    for (i, (name, svc)) in cfg.services.iter().enumerate() {
        let rev_nat_index = i as u16 + 1;
        let opts = svc.options();
        let flags = service_flags(svc, &opts);
        let algorithm = Algorithm::from(svc.algorithm);
        let spec = ServiceSpec {
            address: svc.address,
            port: svc.port,
            proto: svc.protocol as u8,
            template: Service {
                flags,
                affinity_timeout: svc.affinity_timeout,
                algorithm,
                l7_proxy_port: opts.l7_proxy_port(),
                ..Default::default()
            },
            cfg: svc,
        };

        let frontends = match svc.address {
            IpAddr::V4(_) => installer.install_service::<std::net::Ipv4Addr>(
                dir,
                &spec,
                rev_nat_index,
                &mut internal_index,
            )?,
            IpAddr::V6(_) => installer.install_service::<std::net::Ipv6Addr>(
                dir,
                &spec,
                rev_nat_index,
                &mut internal_index,
            )?,
        };

        services.push(ServiceEntry {
            name: name.clone(),
            endpoint: EndPoint {
                ipaddr: svc.address,
                proto: svc.protocol,
                port: svc.port,
            },
            flags,
            algorithm,
            frontends,
        });
    }
    catalog.services = services;

    for skip in &cfg.skip_lb {
        match skip.address {
            IpAddr::V4(address) => dir.v4.insert_skip(SkipKey {
                netns_cookie: skip.netns_cookie,
                address,
                port: skip.port,
            }),
            IpAddr::V6(address) => dir.v6.insert_skip(SkipKey {
                netns_cookie: skip.netns_cookie,
                address,
                port: skip.port,
            }),
        }
    }

    info!(
        "[svc] Installed {} services and {} backends",
        catalog.services.len(),
        catalog.backends.len()
    );
    Ok(catalog)
}

/// Moves a backend to a new state, existing flows keep it while it drains.
pub fn set_backend_state(dir: &Directory, id: u32, state: BackendState) -> bool {
    dir.v4.update_backend(id, |be| be.state = state) || dir.v6.update_backend(id, |be| be.state = state)
}

pub fn list_services(catalog: &Catalog, lb: &LbConfig) {
    let mut tab = InfoTable::new(vec![
        "name", "frontend", "scope", "rev_nat", "backends", "algorithm", "flags",
    ]);
    for svc in &catalog.services {
        let algorithm = match lb.selection {
            Selection::Fixed(alg) => alg,
            Selection::PerService => svc.algorithm,
        };
        let opts = Options::new(svc.flags);
        for fe in &svc.frontends {
            let names = fe
                .backends
                .iter()
                .map(|id| catalog.backend_name(*id).unwrap_or("?"))
                .collect::<Vec<_>>();
            tab.push_row(vec![
                svc.name.clone(),
                svc.endpoint.to_string(),
                format!("{:?}", fe.scope).to_lowercase(),
                fe.rev_nat_index.to_string(),
                names.join(","),
                format!("{:?}", algorithm).to_lowercase(),
                opts.to_string(),
            ]);
        }
    }
    tab.print("Services");
}

pub fn list_backends(catalog: &Catalog, dir: &Directory) {
    let mut tab = InfoTable::new(vec!["name", "id", "endpoint", "state", "zone", "cluster"]);
    for (name, id) in &catalog.backends {
        let row = match (dir.v4.backends.get(id), dir.v6.backends.get(id)) {
            (Some(be), _) => (be.as_endpoint(), be.state, be.zone, be.cluster_id),
            (_, Some(be)) => (be.as_endpoint(), be.state, be.zone, be.cluster_id),
            _ => continue,
        };
        tab.push_row(vec![
            name.clone(),
            id.to_string(),
            row.0.to_string(),
            format!("{:?}", row.1).to_lowercase(),
            row.2.to_string(),
            row.3.to_string(),
        ]);
    }
    tab.print("Backends");
}

/// Prints how the Maglev table of a service spreads over its backends.
pub fn print_maglev<A: FamilyTables>(
    tables: &ServiceTables<A>,
    catalog: &Catalog,
    svc: &ServiceEntry,
    lb: &LbConfig,
) -> Result<(), anyhow::Error> {
    for fe in &svc.frontends {
        let table = tables.maglev_table(fe.rev_nat_index).ok_or(anyhow!(
            "Service {} has no Maglev table, select maglev for it",
            svc.name
        ))?;
        let dist = maglev::distribution(&table);
        let mut tab = InfoTable::new(vec!["backend", "id", "buckets", "share"]);
        for (id, count) in dist {
            tab.push_row(vec![
                catalog.backend_name(id).unwrap_or("?").to_string(),
                id.to_string(),
                count.to_string(),
                format!("{:.2}%", count as f64 * 100.0 / table.len() as f64),
            ]);
        }
        tab.print(&format!(
            "Maglev table of {} ({:?} scope, {} buckets)",
            svc.name,
            fe.scope,
            table.len()
        ));
    }
    Ok(())
}
