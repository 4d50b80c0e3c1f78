//! Line-oriented admin front end.
//!
//! Parses one text command per line into an [`AdminRequest`], forwards it
//! to the owner task over a channel, and writes the rendered reply back.
//! Replies follow a simple convention: `+` for success lines, `-ERR` for
//! failures, multi-line payloads terminated by a blank line.

use bytes::Bytes;
use keel_cluster::{AdminReply, AdminRequest, NodeId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::debug;

/// One admin request plus the channel its reply goes back on.
pub type AdminCall = (AdminRequest, oneshot::Sender<String>);

/// Serves a single admin connection until EOF or QUIT.
pub async fn handle_admin_conn(stream: TcpStream, calls: UnboundedSender<AdminCall>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") {
            break;
        }

        let response = match parse_command(line) {
            Ok(request) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if calls.send((request, reply_tx)).is_err() {
                    break; // server is shutting down
                }
                match reply_rx.await {
                    Ok(rendered) => rendered,
                    Err(_) => break,
                }
            }
            Err(reason) => format!("-ERR {reason}"),
        };

        if write_half
            .write_all(format!("{response}\n").as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
    debug!("admin connection closed");
}

fn parse_node_id(token: &str) -> Result<NodeId, String> {
    NodeId::parse(token)
}

fn parse_slot(token: &str) -> Result<u16, String> {
    token.parse().map_err(|_| format!("invalid slot '{token}'"))
}

/// Maps one command line onto the cluster's admin surface.
pub fn parse_command(line: &str) -> Result<AdminRequest, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return Err("empty command".to_string());
    };
    let command = first.to_ascii_uppercase();
    let args = &tokens[1..];

    let wrong_arity = || format!("wrong number of arguments for {command}");

    match command.as_str() {
        "MEET" => {
            let [ip, port] = args else {
                return Err(wrong_arity());
            };
            Ok(AdminRequest::Meet {
                ip: ip.parse().map_err(|_| format!("invalid ip '{ip}'"))?,
                port: port.parse().map_err(|_| format!("invalid port '{port}'"))?,
            })
        }
        "PEERS" => Ok(AdminRequest::Peers),
        "MYID" => Ok(AdminRequest::MyId),
        "INFO" => Ok(AdminRequest::Info),
        "ADDSLOTS" | "DELSLOTS" => {
            if args.is_empty() {
                return Err(wrong_arity());
            }
            let slots = args
                .iter()
                .map(|t| parse_slot(t))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if command == "ADDSLOTS" {
                AdminRequest::AddSlots(slots)
            } else {
                AdminRequest::DelSlots(slots)
            })
        }
        "SETSLOT" => {
            let (slot, rest) = match args {
                [slot, rest @ ..] if !rest.is_empty() => (parse_slot(slot)?, rest),
                _ => return Err(wrong_arity()),
            };
            match (rest[0].to_ascii_uppercase().as_str(), &rest[1..]) {
                ("MIGRATING", [dest]) => Ok(AdminRequest::SetSlotMigrating {
                    slot,
                    dest: parse_node_id(dest)?,
                }),
                ("IMPORTING", [src]) => Ok(AdminRequest::SetSlotImporting {
                    slot,
                    src: parse_node_id(src)?,
                }),
                ("STABLE", []) => Ok(AdminRequest::SetSlotStable { slot }),
                ("NODE", [owner]) => Ok(AdminRequest::SetSlotOwner {
                    slot,
                    owner: parse_node_id(owner)?,
                }),
                _ => Err("SETSLOT expects MIGRATING|IMPORTING|STABLE|NODE".to_string()),
            }
        }
        "FORGET" => {
            let [id] = args else {
                return Err(wrong_arity());
            };
            Ok(AdminRequest::Forget {
                id: parse_node_id(id)?,
            })
        }
        "REPLICATE" => {
            let [id] = args else {
                return Err(wrong_arity());
            };
            Ok(AdminRequest::Replicate {
                primary: parse_node_id(id)?,
            })
        }
        "FAILOVER" => match args {
            [] => Ok(AdminRequest::Failover { force: false }),
            [force] if force.eq_ignore_ascii_case("force") => {
                Ok(AdminRequest::Failover { force: true })
            }
            _ => Err("FAILOVER takes an optional FORCE".to_string()),
        },
        "SET-EPOCH" => {
            let [epoch] = args else {
                return Err(wrong_arity());
            };
            Ok(AdminRequest::SetEpoch {
                epoch: epoch
                    .parse()
                    .map_err(|_| format!("invalid epoch '{epoch}'"))?,
            })
        }
        "RESET" => match args {
            [] => Ok(AdminRequest::Reset { hard: false }),
            [mode] if mode.eq_ignore_ascii_case("soft") => {
                Ok(AdminRequest::Reset { hard: false })
            }
            [mode] if mode.eq_ignore_ascii_case("hard") => Ok(AdminRequest::Reset { hard: true }),
            _ => Err("RESET takes an optional SOFT|HARD".to_string()),
        },
        "PUBLISH" => {
            let [channel, payload @ ..] = args else {
                return Err(wrong_arity());
            };
            if payload.is_empty() {
                return Err(wrong_arity());
            }
            Ok(AdminRequest::Publish {
                channel: Bytes::copy_from_slice(channel.as_bytes()),
                payload: Bytes::copy_from_slice(payload.join(" ").as_bytes()),
            })
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Renders an admin reply for the wire.
pub fn render_reply(reply: &AdminReply) -> String {
    match reply {
        AdminReply::Ok => "+OK".to_string(),
        AdminReply::MyId(id) => format!("+{id}"),
        AdminReply::Peers(lines) => {
            let mut out = String::new();
            for line in lines {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("+END");
            out
        }
        AdminReply::Info(info) => format!("{info}\n+END"),
    }
}
