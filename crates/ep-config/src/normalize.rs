//! Node-set normalisation: names, ports, credentials, virtual-pool checks.
//!
//! Ports are a finite shared resource across frontends and virtual pools;
//! assignment happens serially here, verifying availability with a trial
//! bind. `normalize_with_port_map` keeps assignments stable across reloads:
//! external clients hard-code multi-port ports, so a retained URI must keep
//! its port.

use std::collections::{HashMap, HashSet};

use crate::{port_available, Config, ConfigError, Mode};

impl Config {
    /// Apply defaults and assign ports from scratch.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        self.normalize_with_port_map(&HashMap::new())
    }

    /// Apply defaults and assign ports, preserving assignments for URIs
    /// present in `port_map`. New nodes fill the gaps from `base_port`
    /// upward; removed URIs simply stop occupying their port.
    pub fn normalize_with_port_map(
        &mut self,
        port_map: &HashMap<String, u16>,
    ) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if self.log_level.is_empty() {
            self.log_level = "info".into();
        }
        if self.singbox_log_level.is_empty() {
            // 默认抑制内核适配层的 info 级日志
            self.singbox_log_level = "warn".into();
        }

        let mut used_ports: HashSet<u16> = HashSet::new();
        if self.mode == Mode::Hybrid {
            used_ports.insert(self.listener.port);
        }

        // First pass: names, then preserved ports.
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            node.name = node.name.trim().to_string();
            node.uri = node.uri.trim().to_string();
            if node.uri.is_empty() {
                return Err(ConfigError::MissingUri { index: idx });
            }
            if node.name.is_empty() {
                node.name = node
                    .name_from_uri()
                    .unwrap_or_else(|| format!("node-{idx}"));
            }
            if node.port > 0 {
                used_ports.insert(node.port);
            } else if self.mode.has_node_listeners() {
                if let Some(&port) = port_map.get(node.node_key()) {
                    node.port = port;
                    used_ports.insert(port);
                    tracing::debug!(port, name = %node.name, "preserved node port");
                }
            }
        }

        // Second pass: fresh assignments for the rest.
        let mut cursor = self.multi_port.base_port;
        for node in &mut self.nodes {
            if node.port != 0 {
                continue;
            }
            if self.mode.has_node_listeners() {
                while used_ports.contains(&cursor)
                    || !port_available(&self.multi_port.address, cursor)
                {
                    tracing::warn!(port = cursor, "port is in use, trying next");
                    cursor = cursor.checked_add(1).ok_or(ConfigError::PortsExhausted {
                        base: self.multi_port.base_port,
                    })?;
                }
                node.port = cursor;
                used_ports.insert(cursor);
                tracing::debug!(port = cursor, name = %node.name, "assigned node port");
            } else {
                node.port = cursor;
            }
            cursor = cursor.checked_add(1).ok_or(ConfigError::PortsExhausted {
                base: self.multi_port.base_port,
            })?;
        }

        // Per-node credentials default to the multi_port globals.
        if self.mode.has_node_listeners() {
            for node in &mut self.nodes {
                if node.username.is_empty() {
                    node.username = self.multi_port.username.clone();
                    node.password = self.multi_port.password.clone();
                }
            }
        }

        if self.mode == Mode::Hybrid {
            self.fix_hybrid_port_collisions()?;
        }
        self.validate_virtual_pools()?;
        Ok(())
    }

    /// In hybrid mode the pool listener shares the port space with the node
    /// listeners; a node that landed on the pool port gets moved.
    fn fix_hybrid_port_collisions(&mut self) -> Result<(), ConfigError> {
        let pool_port = self.listener.port;
        let mut used: HashSet<u16> = self.nodes.iter().map(|n| n.port).collect();
        used.insert(pool_port);
        for node in &mut self.nodes {
            if node.port != pool_port {
                continue;
            }
            let mut candidate = node.port;
            loop {
                candidate = candidate.checked_add(1).ok_or(ConfigError::PortsExhausted {
                    base: self.multi_port.base_port,
                })?;
                if !used.contains(&candidate) && port_available(&self.multi_port.address, candidate)
                {
                    break;
                }
            }
            tracing::warn!(
                name = %node.name,
                old = pool_port,
                new = candidate,
                "node port conflicts with pool listener, reassigned"
            );
            used.insert(candidate);
            node.port = candidate;
        }
        Ok(())
    }

    /// Name uniqueness, regex syntax, strategy, port collisions.
    fn validate_virtual_pools(&mut self) -> Result<(), ConfigError> {
        if self.virtual_pools.is_empty() {
            return Ok(());
        }

        let mut used_ports: HashMap<u16, String> = HashMap::new();
        if self.mode.has_pool_listener() {
            used_ports.insert(self.listener.port, "listener".into());
        }
        if self.management_enabled() {
            if let Some(port) = self
                .management
                .listen
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse::<u16>().ok())
            {
                used_ports.insert(port, "management".into());
            }
        }
        if self.mode.has_node_listeners() {
            for node in &self.nodes {
                if node.port > 0 {
                    used_ports.insert(node.port, format!("node:{}", node.name));
                }
            }
        }

        let err = |index: usize, name: &str, reason: String| ConfigError::VirtualPool {
            index,
            name: name.to_string(),
            reason,
        };

        let mut names = HashSet::new();
        for (idx, pool) in self.virtual_pools.iter_mut().enumerate() {
            if pool.name.is_empty() {
                return Err(err(idx, "", "name is required".into()));
            }
            if !names.insert(pool.name.clone()) {
                return Err(err(idx, &pool.name, "duplicate pool name".into()));
            }
            if pool.regular.is_empty() {
                return Err(err(idx, &pool.name, "regular expression is required".into()));
            }
            if let Err(e) = regex::Regex::new(&pool.regular) {
                return Err(err(
                    idx,
                    &pool.name,
                    format!("invalid regular expression {:?}: {e}", pool.regular),
                ));
            }
            if pool.address.is_empty() {
                pool.address = "0.0.0.0".into();
            }
            if pool.port == 0 {
                return Err(err(idx, &pool.name, "port is required".into()));
            }
            if let Some(owner) = used_ports.get(&pool.port) {
                return Err(err(
                    idx,
                    &pool.name,
                    format!("port {} conflicts with {}", pool.port, owner),
                ));
            }
            used_ports.insert(pool.port, format!("virtual_pool:{}", pool.name));
            if pool.strategy.is_empty() {
                pool.strategy = "sequential".into();
            }
            match pool.strategy.as_str() {
                "sequential" | "random" | "balance" | "weighted" => {}
                other => {
                    return Err(err(
                        idx,
                        &pool.name,
                        format!(
                            "invalid strategy {other:?} (use 'sequential', 'random', 'balance' or 'weighted')"
                        ),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeConfig, VirtualPoolConfig};

    fn base_config(mode: Mode, uris: &[&str]) -> Config {
        let mut cfg = Config {
            mode,
            ..Config::default()
        };
        // high base to dodge ports used by the host
        cfg.multi_port.base_port = 41200;
        cfg.nodes = uris
            .iter()
            .map(|u| NodeConfig {
                uri: (*u).to_string(),
                ..NodeConfig::default()
            })
            .collect();
        cfg
    }

    #[test]
    fn names_fall_back_to_fragment_then_index() {
        let mut cfg = base_config(Mode::Pool, &["ss://a@h:1#HK-01", "ss://b@h:2"]);
        cfg.normalize().unwrap();
        assert_eq!(cfg.nodes[0].name, "HK-01");
        assert_eq!(cfg.nodes[1].name, "node-1");
    }

    #[test]
    fn ports_assigned_sequentially_in_multi_port() {
        let mut cfg = base_config(Mode::MultiPort, &["ss://a@h:1#a", "ss://b@h:2#b"]);
        cfg.normalize().unwrap();
        assert_eq!(cfg.nodes[0].port, 41200);
        assert_eq!(cfg.nodes[1].port, 41201);
    }

    #[test]
    fn port_map_preserves_retained_nodes() {
        let mut cfg = base_config(
            Mode::MultiPort,
            &["ss://kept@h:1#kept", "ss://new@h:2#new"],
        );
        let mut map = HashMap::new();
        map.insert("ss://kept@h:1#kept".to_string(), 41999u16);
        cfg.normalize_with_port_map(&map).unwrap();
        assert_eq!(cfg.nodes[0].port, 41999);
        // new node fills from base_port, not after the preserved port
        assert_eq!(cfg.nodes[1].port, 41200);
    }

    #[test]
    fn removed_nodes_free_their_ports() {
        let mut old = base_config(Mode::MultiPort, &["ss://a@h:1#a", "ss://b@h:2#b"]);
        old.normalize().unwrap();
        let map = old.build_port_map();

        // reload without node b; a new node may reuse b's slot
        let mut next = base_config(Mode::MultiPort, &["ss://a@h:1#a", "ss://c@h:3#c"]);
        next.normalize_with_port_map(&map).unwrap();
        assert_eq!(next.nodes[0].port, map["ss://a@h:1#a"]);
        assert_eq!(next.nodes[1].port, 41201);
    }

    #[test]
    fn hybrid_moves_node_off_pool_port() {
        let mut cfg = base_config(Mode::Hybrid, &["ss://a@h:1#a"]);
        cfg.listener.port = 41300;
        cfg.nodes[0].port = 41300;
        cfg.normalize().unwrap();
        assert_ne!(cfg.nodes[0].port, 41300);
    }

    #[test]
    fn multi_port_credentials_default_to_globals() {
        let mut cfg = base_config(Mode::MultiPort, &["ss://a@h:1#a"]);
        cfg.multi_port.username = "mp".into();
        cfg.multi_port.password = "secret".into();
        cfg.normalize().unwrap();
        assert_eq!(cfg.nodes[0].username, "mp");
        assert_eq!(cfg.nodes[0].password, "secret");
    }

    #[test]
    fn virtual_pool_validation_rejects_bad_regex_and_collisions() {
        let mut cfg = base_config(Mode::MultiPort, &["ss://a@h:1#a"]);
        cfg.virtual_pools = vec![VirtualPoolConfig {
            name: "fast".into(),
            regular: "([".into(),
            address: "127.0.0.1".into(),
            port: 41400,
            username: String::new(),
            password: String::new(),
            strategy: "sequential".into(),
            max_latency_ms: 0,
        }];
        assert!(matches!(
            cfg.normalize(),
            Err(ConfigError::VirtualPool { .. })
        ));

        let mut cfg = base_config(Mode::MultiPort, &["ss://a@h:1#a"]);
        cfg.management.listen = "127.0.0.1:41500".into();
        cfg.virtual_pools = vec![VirtualPoolConfig {
            name: "fast".into(),
            regular: "^HK".into(),
            address: "127.0.0.1".into(),
            port: 41500,
            username: String::new(),
            password: String::new(),
            strategy: "sequential".into(),
            max_latency_ms: 0,
        }];
        let e = cfg.normalize().unwrap_err();
        assert!(e.to_string().contains("conflicts with management"));
    }

    #[test]
    fn virtual_pool_defaults_applied() {
        let mut cfg = base_config(Mode::MultiPort, &["ss://a@h:1#a"]);
        cfg.virtual_pools = vec![VirtualPoolConfig {
            name: "fast".into(),
            regular: "^HK".into(),
            address: String::new(),
            port: 41600,
            username: String::new(),
            password: String::new(),
            strategy: String::new(),
            max_latency_ms: 0,
        }];
        cfg.normalize().unwrap();
        assert_eq!(cfg.virtual_pools[0].address, "0.0.0.0");
        assert_eq!(cfg.virtual_pools[0].strategy, "sequential");
    }
}
