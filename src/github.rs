use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrComment {
    pub author: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Repository permission of a commenter, from most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorPermission {
    Admin,
    Maintain,
    Write,
    Triage,
    Read,
    None,
}

impl ActorPermission {
    pub fn parse(s: &str) -> ActorPermission {
        match s.trim().to_lowercase().as_str() {
            "admin" => ActorPermission::Admin,
            "maintain" => ActorPermission::Maintain,
            "write" => ActorPermission::Write,
            "triage" => ActorPermission::Triage,
            "read" => ActorPermission::Read,
            _ => ActorPermission::None,
        }
    }

    pub fn has_write(&self) -> bool {
        matches!(
            self,
            ActorPermission::Admin | ActorPermission::Maintain | ActorPermission::Write
        )
    }

    pub fn is_maintainer(&self) -> bool {
        matches!(self, ActorPermission::Admin | ActorPermission::Maintain)
    }
}

/// Everything the aggregator and triage guard need to know about a PR.
/// Both depend on this capability, never on the network directly.
pub trait PrState {
    fn head_sha(&self) -> Result<String>;
    fn pr_author(&self) -> Result<String>;
    fn comments(&self) -> Result<Vec<PrComment>>;
    fn actor_permission(&self, login: &str) -> Result<ActorPermission>;
    /// Find a comment containing `marker` and edit it in place, else create
    /// one. The idempotency contract for every cerberus comment surface.
    fn upsert_comment(&self, marker: &str, body: &str) -> Result<()>;
}

// --- gh CLI backing ---

/// Abstraction over `gh` CLI execution for testability.
pub trait GhClient {
    fn run(&self, args: &[&str]) -> Result<String>;
}

/// Real `gh` CLI client with retry and exponential backoff.
pub struct DefaultGhClient;

impl GhClient for DefaultGhClient {
    fn run(&self, args: &[&str]) -> Result<String> {
        retry_with_backoff(|| {
            let output = Command::new("gh")
                .args(args)
                .output()
                .map_err(|e| Error::PrState(format!("failed to run gh: {e}")))?;

            if output.status.success() {
                String::from_utf8(output.stdout)
                    .map_err(|e| Error::PrState(format!("invalid utf8 from gh: {e}")))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::PrState(format!("gh failed: {stderr}")))
            }
        })
    }
}

fn retry_with_backoff<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(attempt, "gh invocation failed: {e}");
                last_err = Some(e);
                if attempt + 1 < MAX_RETRIES {
                    thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::PrState("gh retries exhausted".into())))
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    owner: RepoOwner,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PrView {
    #[serde(rename = "headRefOid")]
    head_ref_oid: Option<String>,
    author: Option<RepoOwner>,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    body: Option<String>,
    user: RepoOwner,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    permission: Option<String>,
    role_name: Option<String>,
}

/// Live PR state backed by the `gh` CLI.
pub struct GithubPrState {
    pr_number: u64,
    client: Box<dyn GhClient>,
}

impl GithubPrState {
    pub fn new(pr_number: u64) -> Self {
        Self {
            pr_number,
            client: Box::new(DefaultGhClient),
        }
    }

    pub fn with_client(pr_number: u64, client: Box<dyn GhClient>) -> Self {
        Self { pr_number, client }
    }

    fn repo_nwo(&self) -> Result<(String, String)> {
        let json = self.client.run(&["repo", "view", "--json", "owner,name"])?;
        let info: RepoInfo = serde_json::from_str(&json)
            .map_err(|e| Error::PrState(format!("failed to parse repo info: {e}")))?;
        Ok((info.owner.login, info.name))
    }

    fn pr_view(&self, fields: &str) -> Result<PrView> {
        let n = self.pr_number.to_string();
        let json = self.client.run(&["pr", "view", &n, "--json", fields])?;
        serde_json::from_str(&json).map_err(|e| Error::PrState(format!("failed to parse pr view: {e}")))
    }

    fn api_comments(&self) -> Result<Vec<ApiComment>> {
        let (owner, name) = self.repo_nwo()?;
        let path = format!("repos/{owner}/{name}/issues/{}/comments", self.pr_number);
        let json = self.client.run(&["api", &path, "--paginate"])?;
        serde_json::from_str(&json)
            .map_err(|e| Error::PrState(format!("failed to parse comments: {e}")))
    }
}

impl PrState for GithubPrState {
    fn head_sha(&self) -> Result<String> {
        self.pr_view("headRefOid")?
            .head_ref_oid
            .ok_or_else(|| Error::PrState("pr view returned no headRefOid".into()))
    }

    fn pr_author(&self) -> Result<String> {
        Ok(self
            .pr_view("author")?
            .author
            .ok_or_else(|| Error::PrState("pr view returned no author".into()))?
            .login)
    }

    fn comments(&self) -> Result<Vec<PrComment>> {
        Ok(self
            .api_comments()?
            .into_iter()
            .map(|c| PrComment {
                author: c.user.login,
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            })
            .collect())
    }

    fn actor_permission(&self, login: &str) -> Result<ActorPermission> {
        let (owner, name) = self.repo_nwo()?;
        let path = format!("repos/{owner}/{name}/collaborators/{login}/permission");
        let json = match self.client.run(&["api", &path]) {
            Ok(json) => json,
            // Non-collaborators 404; that is an answer, not an error.
            Err(e) => {
                debug!(login, "permission lookup failed, treating as none: {e}");
                return Ok(ActorPermission::None);
            }
        };
        let resp: PermissionResponse = serde_json::from_str(&json)
            .map_err(|e| Error::PrState(format!("failed to parse permission: {e}")))?;
        // role_name is finer-grained (maintain/triage) when present.
        let raw = resp.role_name.or(resp.permission).unwrap_or_default();
        Ok(ActorPermission::parse(&raw))
    }

    fn upsert_comment(&self, marker: &str, body: &str) -> Result<()> {
        let existing = self
            .api_comments()?
            .into_iter()
            .find(|c| c.body.as_deref().is_some_and(|b| b.contains(marker)));
        let (owner, name) = self.repo_nwo()?;
        match existing {
            Some(comment) => {
                let path = format!("repos/{owner}/{name}/issues/comments/{}", comment.id);
                self.client
                    .run(&["api", "-X", "PATCH", &path, "-f", &format!("body={body}")])?;
            }
            None => {
                let path = format!("repos/{owner}/{name}/issues/{}/comments", self.pr_number);
                self.client
                    .run(&["api", "-X", "POST", &path, "-f", &format!("body={body}")])?;
            }
        }
        Ok(())
    }
}

// --- file/memory backing (CI artifact replay and tests) ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrSnapshot {
    pub head_sha: String,
    pub author: String,
    #[serde(default)]
    pub comments: Vec<PrComment>,
    /// login -> permission string (admin/maintain/write/triage/read/none)
    #[serde(default)]
    pub permissions: std::collections::BTreeMap<String, String>,
}

/// PR state materialized as a JSON snapshot. Upserts mutate the snapshot in
/// memory and, when a path is attached, write it back so the CI wrapper can
/// post the result.
pub struct FilePrState {
    snapshot: RefCell<PrSnapshot>,
    path: Option<PathBuf>,
}

impl FilePrState {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::PrState(format!("failed to read {}: {e}", path.display())))?;
        let snapshot: PrSnapshot = serde_json::from_str(&content)
            .map_err(|e| Error::PrState(format!("malformed pr snapshot {}: {e}", path.display())))?;
        Ok(Self {
            snapshot: RefCell::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory(snapshot: PrSnapshot) -> Self {
        Self {
            snapshot: RefCell::new(snapshot),
            path: None,
        }
    }

    pub fn snapshot(&self) -> PrSnapshot {
        self.snapshot.borrow().clone()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&*self.snapshot.borrow())
                .map_err(|e| Error::PrState(format!("failed to serialize snapshot: {e}")))?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }
}

impl PrState for FilePrState {
    fn head_sha(&self) -> Result<String> {
        Ok(self.snapshot.borrow().head_sha.clone())
    }

    fn pr_author(&self) -> Result<String> {
        Ok(self.snapshot.borrow().author.clone())
    }

    fn comments(&self) -> Result<Vec<PrComment>> {
        Ok(self.snapshot.borrow().comments.clone())
    }

    fn actor_permission(&self, login: &str) -> Result<ActorPermission> {
        Ok(self
            .snapshot
            .borrow()
            .permissions
            .get(login)
            .map(|s| ActorPermission::parse(s))
            .unwrap_or(ActorPermission::None))
    }

    fn upsert_comment(&self, marker: &str, body: &str) -> Result<()> {
        {
            let mut snap = self.snapshot.borrow_mut();
            match snap.comments.iter_mut().find(|c| c.body.contains(marker)) {
                Some(existing) => existing.body = body.to_string(),
                None => snap.comments.push(PrComment {
                    author: "cerberus".to_string(),
                    body: body.to_string(),
                    created_at: None,
                }),
            }
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MockGh {
        responses: RefCell<Vec<(String, String)>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl MockGh {
        fn new(responses: Vec<(&str, &str)>) -> Self {
            Self {
                responses: RefCell::new(
                    responses
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl GhClient for MockGh {
        fn run(&self, args: &[&str]) -> Result<String> {
            self.calls
                .borrow_mut()
                .push(args.iter().map(|s| s.to_string()).collect());
            let joined = args.join(" ");
            let responses = self.responses.borrow();
            responses
                .iter()
                .find(|(k, _)| joined.contains(k.as_str()))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::PrState(format!("unexpected gh call: {joined}")))
        }
    }

    #[test]
    fn permission_levels() {
        assert!(ActorPermission::parse("admin").has_write());
        assert!(ActorPermission::parse("WRITE").has_write());
        assert!(!ActorPermission::parse("read").has_write());
        assert!(ActorPermission::parse("maintain").is_maintainer());
        assert!(!ActorPermission::parse("write").is_maintainer());
        assert_eq!(ActorPermission::parse("stranger"), ActorPermission::None);
    }

    #[test]
    fn github_head_sha_parses() {
        let mock = MockGh::new(vec![(
            "pr view 7 --json headRefOid",
            r#"{"headRefOid": "abc1234deadbeef"}"#,
        )]);
        let state = GithubPrState::with_client(7, Box::new(mock));
        assert_eq!(state.head_sha().unwrap(), "abc1234deadbeef");
    }

    #[test]
    fn github_comments_map_fields() {
        let mock = MockGh::new(vec![
            (
                "repo view",
                r#"{"owner": {"login": "acme"}, "name": "widgets"}"#,
            ),
            (
                "repos/acme/widgets/issues/7/comments",
                r#"[{"id": 1, "body": "hello", "user": {"login": "alice"}, "created_at": "2026-07-30T10:00:00Z"}]"#,
            ),
        ]);
        let state = GithubPrState::with_client(7, Box::new(mock));
        let comments = state.comments().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "alice");
        assert_eq!(comments[0].body, "hello");
    }

    #[test]
    fn github_permission_404_is_none() {
        let mock = MockGh::new(vec![(
            "repo view",
            r#"{"owner": {"login": "acme"}, "name": "widgets"}"#,
        )]);
        let state = GithubPrState::with_client(7, Box::new(mock));
        // collaborator endpoint not mocked -> error -> None
        assert_eq!(
            state.actor_permission("stranger").unwrap(),
            ActorPermission::None
        );
    }

    #[test]
    fn github_upsert_patches_existing_marker_comment() {
        let mock = MockGh::new(vec![
            (
                "repo view",
                r#"{"owner": {"login": "acme"}, "name": "widgets"}"#,
            ),
            (
                "repos/acme/widgets/issues/7/comments --paginate",
                r#"[{"id": 99, "body": "old <!-- cerberus:verdict -->", "user": {"login": "bot"}}]"#,
            ),
            ("-X PATCH repos/acme/widgets/issues/comments/99", "{}"),
        ]);
        let state = GithubPrState::with_client(7, Box::new(mock));
        state
            .upsert_comment("<!-- cerberus:verdict -->", "new body")
            .unwrap();
    }

    fn snapshot() -> PrSnapshot {
        PrSnapshot {
            head_sha: "abc1234deadbeef".into(),
            author: "alice".into(),
            comments: vec![],
            permissions: BTreeMap::from([
                ("alice".to_string(), "write".to_string()),
                ("bob".to_string(), "read".to_string()),
            ]),
        }
    }

    #[test]
    fn file_state_answers_from_snapshot() {
        let state = FilePrState::in_memory(snapshot());
        assert_eq!(state.head_sha().unwrap(), "abc1234deadbeef");
        assert_eq!(state.pr_author().unwrap(), "alice");
        assert!(state.actor_permission("alice").unwrap().has_write());
        assert_eq!(
            state.actor_permission("mallory").unwrap(),
            ActorPermission::None
        );
    }

    #[test]
    fn upsert_creates_then_updates_never_duplicates() {
        let state = FilePrState::in_memory(snapshot());
        let marker = "<!-- cerberus:verdict -->";
        state
            .upsert_comment(marker, &format!("{marker}\nfirst"))
            .unwrap();
        state
            .upsert_comment(marker, &format!("{marker}\nsecond"))
            .unwrap();
        let comments = state.comments().unwrap();
        let matching: Vec<_> = comments.iter().filter(|c| c.body.contains(marker)).collect();
        assert_eq!(matching.len(), 1);
        assert!(matching[0].body.contains("second"));
    }

    #[test]
    fn file_state_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pr.json");
        let json = serde_json::to_string_pretty(&snapshot()).unwrap();
        std::fs::write(&path, json).unwrap();

        let state = FilePrState::load(&path).unwrap();
        state.upsert_comment("<!-- m -->", "<!-- m --> body").unwrap();

        let reloaded = FilePrState::load(&path).unwrap();
        assert_eq!(reloaded.comments().unwrap().len(), 1);
    }

    #[test]
    fn file_state_malformed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pr.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FilePrState::load(&path).is_err());
    }
}
