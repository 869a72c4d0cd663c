//! Saving state back to disk.
//!
//! Nodes are split by source: inline nodes go back into the YAML `nodes:`
//! array, file- and subscription-sourced nodes go to the external nodes
//! file. Settings updates rewrite only the three runtime knobs. Both paths
//! re-read the document first so unrelated sections survive untouched.

use crate::{nodes, Config, ConfigError, NodeConfig, NodeSource};

impl Config {
    /// Persist nodes to their source locations.
    pub fn save_nodes(&self) -> Result<(), ConfigError> {
        if self.file_path.as_os_str().is_empty() {
            return Err(ConfigError::NoPath);
        }

        let mut inline: Vec<NodeConfig> = Vec::new();
        let mut file: Vec<NodeConfig> = Vec::new();
        for node in &self.nodes {
            let clean = NodeConfig {
                name: node.name.clone(),
                uri: node.uri.clone(),
                port: node.port,
                username: node.username.clone(),
                password: node.password.clone(),
                source: NodeSource::default(),
            };
            match node.source {
                NodeSource::Inline => inline.push(clean),
                NodeSource::File | NodeSource::Subscription => file.push(clean),
            }
        }

        if !file.is_empty() || !self.nodes_file.is_empty() {
            let path = self.nodes_file_path();
            nodes::write_nodes_file(&path, &file).map_err(|source| ConfigError::NodesFile {
                path,
                source,
            })?;
        }

        if !inline.is_empty() {
            self.rewrite_config(|cfg| cfg.nodes = inline.clone())?;
        }
        Ok(())
    }

    /// Persist only `external_ip`, `management.probe_target` and
    /// `skip_cert_verify`; everything else keeps its on-disk value.
    pub fn save_settings(&self) -> Result<(), ConfigError> {
        if self.file_path.as_os_str().is_empty() {
            return Err(ConfigError::NoPath);
        }
        self.rewrite_config(|cfg| {
            cfg.external_ip = self.external_ip.clone();
            cfg.management.probe_target = self.management.probe_target.clone();
            cfg.skip_cert_verify = self.skip_cert_verify;
        })
    }

    /// Re-read the config file, apply `mutate` to the fresh document and
    /// write it back.
    fn rewrite_config<F: FnOnce(&mut Config)>(&self, mutate: F) -> Result<(), ConfigError> {
        let text =
            std::fs::read_to_string(&self.file_path).map_err(|source| ConfigError::Read {
                path: self.file_path.clone(),
                source,
            })?;
        let mut on_disk: Config = serde_yaml::from_str(&text)?;
        mutate(&mut on_disk);
        let out = serde_yaml::to_string(&on_disk)?;
        std::fs::write(&self.file_path, out).map_err(|source| ConfigError::Read {
            path: self.file_path.clone(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;

    fn write_config(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn save_settings_touches_only_runtime_knobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "mode: multi-port\nlistener:\n  port: 3000\nnodes:\n  - uri: ss://a@h:1#a\n",
        );
        let mut cfg = Config::load(&path).unwrap();
        cfg.external_ip = "203.0.113.7".into();
        cfg.management.probe_target = "example.com:80".into();
        cfg.skip_cert_verify = true;
        // a runtime-only change that must NOT be persisted
        cfg.listener.port = 9999;
        cfg.save_settings().unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.external_ip, "203.0.113.7");
        assert_eq!(reloaded.management.probe_target, "example.com:80");
        assert!(reloaded.skip_cert_verify);
        assert_eq!(reloaded.listener.port, 3000);
        assert_eq!(reloaded.mode, Mode::MultiPort);
    }

    #[test]
    fn save_nodes_splits_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "nodes:\n  - uri: ss://inline@h:1#inline\nnodes_file: nodes.txt\n",
        );
        std::fs::write(dir.path().join("nodes.txt"), "ss://file@h:2#file\n").unwrap();

        let mut cfg = Config::load(&path).unwrap();
        cfg.merge_file_nodes().unwrap();
        assert_eq!(cfg.nodes.len(), 2);
        cfg.nodes[1].name = "file".into();
        cfg.save_nodes().unwrap();

        let nodes_txt = std::fs::read_to_string(dir.path().join("nodes.txt")).unwrap();
        assert_eq!(nodes_txt, "ss://file@h:2#file\n");
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.nodes.len(), 1);
        assert_eq!(reloaded.nodes[0].uri, "ss://inline@h:1#inline");
        assert_eq!(reloaded.nodes[0].source, NodeSource::Inline);
    }
}
