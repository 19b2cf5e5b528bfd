//! Diagnostic HTML report.
//!
//! Triggered by the internal service's report type code. The report is a
//! snapshot of the daemon's state - node counters, connected tasks, open
//! request and reply ids, and the IP table - written to one file per node
//! name. Delivery (mail or otherwise) is left to outside tooling.

use crate::nodetable::NodeTable;
use crate::task::TaskKind;
use crate::taskpool::TaskPool;
use acnet_core::TrunkNode;
use chrono::Local;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

const STYLE: &str = "body { font: 10pt Verdana,Arial,Helvetica,sans-serif; }\n\
h1 { font-size: 12pt; }\n\
div.section { padding: 10pt; }\n\
.label { text-align: right; padding-right: 1em; }\n\
.label:after { content: \":\"; }\n\
thead { text-align: left; background: gray; color: white; }\n\
table.dump { width: 45em; margin-top: 12pt; }\n\
tr.even { background: #e0ffe0; }\n";

pub fn write_report(pools: &[TaskPool], table: &NodeTable, dir: &Path) -> io::Result<PathBuf> {
    let node_name = pools
        .first()
        .map(|pool| pool.node_name().to_string())
        .unwrap_or_else(|| "UNKNOWN".into());
    let path = dir.join(format!("acnet_{node_name}.html"));
    let mut out = String::new();

    let _ = write!(
        out,
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Acnet Report</title>\n\
         <style type=\"text/css\">\n{STYLE}</style>\n</head>\n<body>\n\
         <div class=\"section\"><h1>Report for ACNET Node {node_name}</h1>\n\
         <p>Generated {}</p></div>\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    for pool in pools {
        node_section(&mut out, pool);
        task_section(&mut out, pool);
        request_section(&mut out, pool, table);
        reply_section(&mut out, pool, table);
    }
    ip_section(&mut out, table);

    let _ = write!(out, "</body>\n</html>\n");
    std::fs::write(&path, out)?;
    Ok(path)
}

fn node_section(out: &mut String, pool: &TaskPool) {
    let stats = pool.global_stats();
    let rows = [
        ("Received USMs", stats.usm_rcv),
        ("Received Requests", stats.req_rcv),
        ("Received Replies", stats.rpy_rcv),
        ("Transmitted USMs", stats.usm_xmt),
        ("Transmitted Requests", stats.req_xmt),
        ("Transmitted Replies", stats.rpy_xmt),
        ("Request Queue Limit Hits", stats.req_q_limit),
    ];

    let _ = write!(
        out,
        "<div class=\"section\"><h1>Statistics for {} ({})</h1>\n<table class=\"dump\"><tbody>\n",
        pool.node_name(),
        pool.node()
    );
    for (row, (label, value)) in rows.iter().enumerate() {
        let class = if row % 2 == 0 { " class=\"even\"" } else { "" };
        let _ = write!(
            out,
            "<tr{class}><td class=\"label\">{label}</td><td>{value}</td></tr>\n"
        );
    }
    let _ = write!(out, "</tbody></table>\n</div>\n");
}

fn task_section(out: &mut String, pool: &TaskPool) {
    let _ = write!(
        out,
        "<div class=\"section\"><h1>Connected Tasks</h1>\n<table class=\"dump\">\n\
         <thead><tr><td>Id</td><td>Handle</td><td>Kind</td><td>Pid</td>\
         <td>Requests</td><td>Replies</td><td>Socket Errors</td></tr></thead>\n<tbody>\n"
    );
    for (row, task) in pool.iter_tasks().enumerate() {
        let kind = match task.kind {
            TaskKind::Local { receiving: true } => "local (receiving)".into(),
            TaskKind::Local { receiving: false } => "local".into(),
            TaskKind::Remote { remote_addr } => format!("remote {remote_addr}"),
            TaskKind::Multicast { group } => format!("multicast {group}"),
            TaskKind::Internal => "internal".into(),
        };
        let class = if row % 2 == 0 { " class=\"even\"" } else { "" };
        let _ = write!(
            out,
            "<tr{class}><td>{}</td><td>{}</td><td>{kind}</td><td>{}</td>\
             <td>{}</td><td>{}</td><td>{}</td></tr>\n",
            task.id,
            task.handle,
            task.pid,
            task.requests.len(),
            task.replies.len(),
            task.total_socket_errors(),
        );
    }
    let _ = write!(out, "</tbody></table>\n</div>\n");
}

fn node_label(table: &NodeTable, tn: TrunkNode) -> String {
    table
        .node_name(tn)
        .map_or_else(|| tn.to_string(), |name| format!("{name} ({tn})"))
}

fn request_section(out: &mut String, pool: &TaskPool, table: &NodeTable) {
    let _ = write!(
        out,
        "<div class=\"section\"><h1>Request ID Report</h1>\n\
         <p>Max active request IDs: {}</p>\n<table class=\"dump\">\n\
         <thead><tr><td>Id</td><td>Target</td><td>Node</td><td>Owner</td><td>Packets</td></tr></thead>\n<tbody>\n",
        pool.req_pool.max_active_count()
    );
    for (id, info) in pool.req_pool.iter() {
        let owner = pool
            .get(info.owner)
            .map_or_else(|| info.owner.to_string(), |t| t.handle.to_string());
        let mult = if info.wants_mult_replies() { " (MLT)" } else { "" };
        let _ = write!(
            out,
            "<tr><td>{id:#06x}{mult}</td><td>{}</td><td>{}</td><td>{owner}</td><td>{}</td></tr>\n",
            info.task_name,
            node_label(table, info.rem_node),
            info.total_packets.as_u32(),
        );
    }
    let _ = write!(out, "</tbody></table>\n</div>\n");
}

fn reply_section(out: &mut String, pool: &TaskPool, table: &NodeTable) {
    let _ = write!(
        out,
        "<div class=\"section\"><h1>Reply ID Report</h1>\n\
         <p>Max active reply IDs: {}</p>\n<table class=\"dump\">\n\
         <thead><tr><td>Id</td><td>Owner</td><td>Origin</td><td>Request</td><td>Sent</td></tr></thead>\n<tbody>\n",
        pool.rpy_pool.max_active_count()
    );
    for (id, info) in pool.rpy_pool.iter() {
        let owner = pool
            .get(info.owner)
            .map_or_else(|| info.owner.to_string(), |t| t.handle.to_string());
        let mult = if info.is_mult_replier() { " (MLT)" } else { "" };
        let _ = write!(
            out,
            "<tr><td>{id:#06x}{mult}</td><td>{owner}</td>\
             <td>Task {} on {}</td><td>{:#06x}</td><td>{}</td></tr>\n",
            info.clnt_task_id,
            node_label(table, info.rem_node),
            info.req_id,
            info.total_packets.as_u32(),
        );
    }
    let _ = write!(out, "</tbody></table>\n</div>\n");
}

fn ip_section(out: &mut String, table: &NodeTable) {
    let _ = write!(out, "<div class=\"section\"><h1>IP Table Report</h1>\n");

    match table.last_download_sec() {
        Some(sec) => {
            let _ = write!(out, "<p>Last node table download: {sec} (epoch)</p>\n");
        }
        None => {
            let _ = write!(out, "<p>Waiting for node table download</p>\n");
        }
    }

    let _ = write!(
        out,
        "<table width=\"80%\">\n<thead><tr><td>TRUNK</td><td>NODE</td>\
         <td>IP Address</td><td>NAME</td></tr></thead>\n<tbody>\n"
    );

    let mut rows = Vec::new();

    for trunk in 0..=255u8 {
        if !table.trunk_exists(trunk) {
            continue;
        }
        for node in 0..=255u8 {
            let tn = TrunkNode::new(trunk, node);

            if let Some(entry) = table.entry(tn) {
                rows.push((trunk, node, entry.addr, entry.name));
            }
        }
    }
    for (row, (trunk, node, addr, name)) in rows.iter().enumerate() {
        let class = if row % 2 == 0 { " class=\"even\"" } else { "" };
        let _ = write!(
            out,
            "<tr{class}><td>{trunk:x}</td><td>{node}</td><td>{addr}</td><td>{name}</td></tr>\n"
        );
    }
    let _ = write!(out, "</tbody></table>\n</div>\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use acnet_core::NodeName;
    use std::net::Ipv4Addr;

    #[test]
    fn report_lands_in_the_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = NodeTable::new(
            Some(Ipv4Addr::new(131, 225, 9, 10)),
            NodeName::from_str("CLX42"),
            6801,
        );

        table.update_addr(
            TrunkNode::new(9, 10),
            NodeName::from_str("CLX42"),
            Ipv4Addr::new(131, 225, 9, 10),
        );

        let pools = vec![TaskPool::new(
            TrunkNode::new(9, 10),
            NodeName::from_str("CLX42"),
            100,
        )];

        let path = write_report(&pools, &table, dir.path()).unwrap();

        assert_eq!(path.file_name().unwrap(), "acnet_CLX42.html");

        let html = std::fs::read_to_string(&path).unwrap();

        assert!(html.contains("Report for ACNET Node CLX42"));
        assert!(html.contains("ACNET"));
        assert!(html.contains("131.225.9.10"));
        assert!(html.contains("IP Table Report"));
    }
}
