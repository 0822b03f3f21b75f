//! Canonical topology model, the on-disk topology text format, and metadata.
//!
//! File layout (whitespace separated):
//!
//! ```text
//! <nodes> <gpus_per_server> <nv_switches> <switches> <links> [gpu_type]
//! <switch id> <switch id> ...
//! <src> <dst> <bandwidth> <latency> <error_rate>     (one row per link)
//! ```
//!
//! Link quantities may be bare canonical numbers or unit-suffixed strings; both
//! parse to the same [`Link`]. Rendering picks one [`Convention`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::units::{Convention, Quantity, parse_quantity, to_backend_units};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub src: usize,
    pub dst: usize,
    /// Bits per second.
    pub bandwidth_bps: f64,
    /// Seconds.
    pub latency_s: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub node_count: usize,
    pub gpus_per_server: usize,
    pub nv_switch_count: usize,
    pub switch_count: usize,
    pub gpu_type: Option<String>,
    pub switch_ids: Vec<usize>,
    pub links: Vec<Link>,
}

/// Contents of `metadata.json` in a topology directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub num_gpus: usize,
    pub gpus_per_server: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_bandwidth_gbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvlink_bandwidth_gbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nics_per_switch: Option<usize>,
    /// Generation-time parameters carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn locate(err: Error, path: Option<&Path>, line_no: usize) -> Error {
    match path {
        Some(path) => err.at(path, line_no),
        None => err,
    }
}

fn parse_count(field: &str, token: &str) -> Result<usize> {
    token
        .parse()
        .map_err(|_| Error::malformed(field, token, "expected a non-negative integer"))
}

impl Topology {
    /// Parse topology text. `path` is only used to locate errors.
    pub fn parse(text: &str, path: Option<&Path>) -> Result<Self> {
        let mut rows = text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let Some((header_no, header)) = rows.next() else {
            return Err(locate(
                Error::malformed("topology", "", "file is empty"),
                path,
                1,
            ));
        };
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() < 5 || fields.len() > 6 {
            return Err(locate(
                Error::malformed(
                    "topology header",
                    header,
                    "expected `<nodes> <gpus_per_server> <nv_switches> <switches> <links> [gpu_type]`",
                ),
                path,
                header_no,
            ));
        }
        let count = |field: &str, token: &str| {
            parse_count(field, token).map_err(|err| locate(err, path, header_no))
        };
        let node_count = count("node count", fields[0])?;
        let gpus_per_server = count("gpus per server", fields[1])?;
        let nv_switch_count = count("nv switch count", fields[2])?;
        let switch_count = count("switch count", fields[3])?;
        let declared_links = count("link count", fields[4])?;
        let gpu_type = fields.get(5).map(|s| (*s).to_string());

        let mut switch_ids = Vec::new();
        if nv_switch_count + switch_count > 0 {
            let Some((ids_no, ids)) = rows.next() else {
                return Err(locate(
                    Error::malformed("switch ids", "", "missing switch id row"),
                    path,
                    header_no + 1,
                ));
            };
            for token in ids.split_whitespace() {
                let id = parse_count("switch id", token).map_err(|err| locate(err, path, ids_no))?;
                if id >= node_count {
                    return Err(locate(
                        Error::malformed(
                            "switch id",
                            token,
                            format!("exceeds node count {node_count}"),
                        ),
                        path,
                        ids_no,
                    ));
                }
                switch_ids.push(id);
            }
        }

        let mut links = Vec::with_capacity(declared_links);
        for (line_no, row) in rows {
            let link = parse_link(row, node_count).map_err(|err| locate(err, path, line_no))?;
            links.push(link);
        }

        if links.len() != declared_links {
            return Err(locate(
                Error::malformed(
                    "link count",
                    declared_links.to_string(),
                    format!("header declares {declared_links} links but {} rows follow", links.len()),
                ),
                path,
                header_no,
            ));
        }

        Ok(Self {
            node_count,
            gpus_per_server,
            nv_switch_count,
            switch_count,
            gpu_type,
            switch_ids,
            links,
        })
    }

    /// Render the topology text in a backend convention.
    pub fn render(&self, convention: Convention) -> String {
        let mut out = format!(
            "{} {} {} {} {}",
            self.node_count,
            self.gpus_per_server,
            self.nv_switch_count,
            self.switch_count,
            self.links.len()
        );
        if let Some(gpu_type) = &self.gpu_type {
            out.push(' ');
            out.push_str(gpu_type);
        }
        out.push('\n');

        if !self.switch_ids.is_empty() {
            let ids: Vec<String> = self.switch_ids.iter().map(ToString::to_string).collect();
            out.push_str(&ids.join(" "));
            out.push('\n');
        }

        for link in &self.links {
            out.push_str(&format!(
                "{} {} {} {} {}\n",
                link.src,
                link.dst,
                to_backend_units(link.bandwidth_bps, Quantity::Bandwidth, convention),
                to_backend_units(link.latency_s, Quantity::Latency, convention),
                to_backend_units(link.error_rate, Quantity::ErrorRate, convention),
            ));
        }
        out
    }

    /// Node ids that are not switches.
    pub fn gpu_ids(&self) -> BTreeSet<usize> {
        let switches: BTreeSet<usize> = self.switch_ids.iter().copied().collect();
        (0..self.node_count).filter(|id| !switches.contains(id)).collect()
    }

    /// Derive `metadata.json` fields from the link structure.
    ///
    /// NVLink switches are the first `nv_switch_count` switch ids. NIC and
    /// NVLink bandwidths are read off the first GPU link to each switch class.
    pub fn derive_metadata(&self, kind: &str) -> TopologyMetadata {
        let gpus = self.gpu_ids();
        let nv_switches: BTreeSet<usize> = self
            .switch_ids
            .iter()
            .take(self.nv_switch_count)
            .copied()
            .collect();
        let other_switches: BTreeSet<usize> = self
            .switch_ids
            .iter()
            .skip(self.nv_switch_count)
            .copied()
            .collect();

        let gpu_link_to = |targets: &BTreeSet<usize>| {
            self.links.iter().find_map(|link| {
                let touches = (gpus.contains(&link.src) && targets.contains(&link.dst))
                    || (gpus.contains(&link.dst) && targets.contains(&link.src));
                touches.then_some(link)
            })
        };

        let nvlink_bandwidth_gbps = gpu_link_to(&nv_switches).map(|l| l.bandwidth_bps / 1e9);
        let nic_link = gpu_link_to(&other_switches);
        let nic_bandwidth_gbps = nic_link.map(|l| l.bandwidth_bps / 1e9);
        let nics_per_switch = nic_link.map(|first| {
            let switch = if gpus.contains(&first.src) {
                first.dst
            } else {
                first.src
            };
            self.links
                .iter()
                .filter(|l| {
                    (l.src == switch && gpus.contains(&l.dst))
                        || (l.dst == switch && gpus.contains(&l.src))
                })
                .count()
        });

        TopologyMetadata {
            kind: kind.to_string(),
            num_gpus: gpus.len(),
            gpus_per_server: self.gpus_per_server,
            gpu_type: self.gpu_type.clone(),
            nic_bandwidth_gbps,
            nvlink_bandwidth_gbps,
            nics_per_switch,
            extra: BTreeMap::new(),
        }
    }
}

fn parse_link(row: &str, node_count: usize) -> Result<Link> {
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::malformed(
            "link",
            row,
            "expected `<src> <dst> <bandwidth> <latency> <error_rate>`",
        ));
    }
    let endpoint = |token: &str| -> Result<usize> {
        let id = parse_count("link endpoint", token)?;
        if id >= node_count {
            return Err(Error::malformed(
                "link endpoint",
                token,
                format!("not a declared node (node count {node_count})"),
            ));
        }
        Ok(id)
    };
    Ok(Link {
        src: endpoint(fields[0])?,
        dst: endpoint(fields[1])?,
        bandwidth_bps: parse_quantity(fields[2], Quantity::Bandwidth)?,
        latency_s: parse_quantity(fields[3], Quantity::Latency)?,
        error_rate: parse_quantity(fields[4], Quantity::ErrorRate)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE: &str = "\
4 2 1 1 4 H100
2 3
0 2 2880000000000 0.000000025 0
1 2 2880000000000 0.000000025 0
0 3 400000000000 0.0000005 0
1 3 400000000000 0.0000005 0
";

    const MIXED: &str = "\
4 2 1 1 4 H100
2 3
0 2 2880Gbps 0.000025ms 0
1 2 2880000000000 0.000000025 0

0 3 400Gbps 0.0005ms 0
1 3 400000000000 500ns 0
";

    #[test]
    fn mixed_forms_parse_identically_to_bare() {
        let bare = Topology::parse(BARE, None).expect("parse bare");
        let mixed = Topology::parse(MIXED, None).expect("parse mixed");
        assert_eq!(bare.links.len(), mixed.links.len());
        for (a, b) in bare.links.iter().zip(&mixed.links) {
            assert_eq!((a.src, a.dst), (b.src, b.dst));
            assert!((a.bandwidth_bps - b.bandwidth_bps).abs() <= a.bandwidth_bps * 1e-9);
            assert!((a.latency_s - b.latency_s).abs() <= a.latency_s * 1e-9);
            assert_eq!(a.error_rate, b.error_rate);
        }
        assert_eq!(mixed.gpu_type.as_deref(), Some("H100"));
        assert_eq!(mixed.switch_ids, vec![2, 3]);
    }

    #[test]
    fn render_suffixed_then_reparse_matches() {
        let topo = Topology::parse(BARE, None).expect("parse");
        let m4 = topo.render(Convention::Suffixed);
        assert!(m4.contains("0 3 400Gbps 0.0005ms 0\n"));
        assert!(m4.starts_with("4 2 1 1 4 H100\n2 3\n"));
        let back = Topology::parse(&m4, None).expect("reparse");
        assert_eq!(back.render(Convention::Raw), topo.render(Convention::Raw));
    }

    #[test]
    fn undeclared_endpoint_is_located() {
        let text = "3 2 0 1 1\n2\n0 7 100Gbps 1ms 0\n";
        let err = Topology::parse(text, Some(Path::new("topo/topology"))).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("link endpoint `7`"), "{msg}");
        assert!(msg.contains("topo/topology:3"), "{msg}");
    }

    #[test]
    fn link_count_mismatch_is_rejected() {
        let text = "3 2 0 1 2\n2\n0 2 100Gbps 1ms 0\n";
        let err = Topology::parse(text, None).unwrap_err();
        assert!(err.to_string().contains("declares 2 links but 1 rows follow"));
    }

    #[test]
    fn metadata_is_derived_from_links() {
        let topo = Topology::parse(BARE, None).expect("parse");
        let meta = topo.derive_metadata("Spectrum-X");
        assert_eq!(meta.kind, "Spectrum-X");
        assert_eq!(meta.num_gpus, 2);
        assert_eq!(meta.gpus_per_server, 2);
        assert_eq!(meta.nvlink_bandwidth_gbps, Some(2880.0));
        assert_eq!(meta.nic_bandwidth_gbps, Some(400.0));
        assert_eq!(meta.nics_per_switch, Some(2));

        let json = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(json["type"], "Spectrum-X");
        assert_eq!(json["gpu_type"], "H100");
    }
}
