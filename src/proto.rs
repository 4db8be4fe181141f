//! Wire format for approval requests and responses
//!
//! Protocol-buffer messages exchanged with the sim server. The server treats
//! the bodies as opaque bytes; only the two endpoints of the approval
//! conversation (the `sim` wrapper and this client) decode them.

use prost::Message;

/// The command a remote user wants to run, as captured by the `sim` wrapper.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandSpec {
    /// Executable name, as invoked.
    #[prost(string, optional, tag = "1")]
    pub command: Option<String>,
    /// Full argv, including argv[0].
    #[prost(string, repeated, tag = "2")]
    pub args: Vec<String>,
    /// Environment entries, `KEY=value`.
    #[prost(string, repeated, tag = "3")]
    pub environ: Vec<String>,
    /// Working directory the command would run in.
    #[prost(string, optional, tag = "4")]
    pub cwd: Option<String>,
}

/// A pending approval request, uniquely identified by a server-assigned id.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApproveRequest {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub command: Option<CommandSpec>,
    /// Host the request originated on.
    #[prost(string, optional, tag = "3")]
    pub host: Option<String>,
    /// User who ran the command.
    #[prost(string, optional, tag = "4")]
    pub user: Option<String>,
    /// Optional free-text reason supplied by the requester.
    #[prost(string, optional, tag = "5")]
    pub justification: Option<String>,
}

/// The decision sent back for a request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApproveResponse {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub approved: Option<bool>,
    /// Optional comment, typically attached to a rejection.
    #[prost(string, optional, tag = "3")]
    pub comment: Option<String>,
}

// prost derives the `id()` accessors on both messages; malformed requests
// that arrived without an id read as "".
impl ApproveRequest {
    pub fn decode_wire(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }

    /// Multi-line human-readable rendering for the prompt.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if let (Some(user), Some(host)) = (&self.user, &self.host) {
            out.push_str(&format!("{user}@{host}"));
        } else if let Some(host) = &self.host {
            out.push_str(host);
        }
        if let Some(cmd) = &self.command {
            if let Some(cwd) = &cmd.cwd {
                out.push_str(&format!(" in {cwd}"));
            }
            out.push_str(" wants to run:\n  ");
            if cmd.args.is_empty() {
                out.push_str(cmd.command.as_deref().unwrap_or("<empty command>"));
            } else {
                out.push_str(&cmd.args.join(" "));
            }
        }
        if let Some(just) = &self.justification {
            out.push_str(&format!("\njustification: {just}"));
        }
        out
    }
}

impl ApproveResponse {
    /// Build a decision for a request that was just popped from the backlog.
    pub fn for_request(req: &ApproveRequest, approved: bool, comment: Option<String>) -> Self {
        ApproveResponse {
            id: req.id.clone(),
            approved: Some(approved),
            comment,
        }
    }

    pub fn encode_wire(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> ApproveRequest {
        ApproveRequest {
            id: Some(id.to_string()),
            command: Some(CommandSpec {
                command: Some("rm".into()),
                args: vec!["rm".into(), "-rf".into(), "/tmp/scratch".into()],
                environ: vec![],
                cwd: Some("/home/thomas".into()),
            }),
            host: Some("shell.example.com".into()),
            user: Some("thomas".into()),
            justification: None,
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ApproveRequest::decode_wire(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn response_carries_request_id() {
        let req = request("ABC123");
        let resp = ApproveResponse::for_request(&req, false, Some("not on a Friday".into()));
        assert_eq!(resp.id(), "ABC123");
        assert_eq!(resp.approved, Some(false));

        let decoded = ApproveResponse::decode(resp.encode_wire().as_slice()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn summary_shows_command_line_and_origin() {
        let s = request("X").summary();
        assert!(s.contains("thomas@shell.example.com"));
        assert!(s.contains("rm -rf /tmp/scratch"));
        assert!(s.contains("/home/thomas"));
    }
}
