//! Use-case API for observing tools and the scheduler front end.
//!
//! # Responsibility
//! - Expose one function per remote operation, returning plain strings or
//!   small records.
//! - Translate every failure into an [`OmpError`] with a stable kind.
//!
//! # Invariants
//! - Each call opens its own connection; no state is shared across calls.
//! - Calls never panic; every failure is an `Err`.
//! - Each call emits one `event=api_call` log line with the operation name,
//!   its metadata parameters and its duration. Passwords, comment text and
//!   document bodies are never logged; documents appear as byte counts.

use crate::error::{ApiResult, ErrorKind, OmpError};
use omp_core::db::open_db_from_config;
use omp_core::document::{history_document, query_result_document};
use omp_core::repo::done_repo::MsbHistory;
use omp_core::{
    init_from_config, HistoryService, MsbActionRequest, MsbCount, MsbService, MsbStoreSettings, ObservedQuery, Payload, Project,
    ProgramService, ProgramVersion, ReturnFormat, SqliteDoneRepository, SqliteMsbRepository,
    OmpConfig, SqliteProjectRepository, SqliteUserRepository, Transition, User, UserRepository,
};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::time::Instant;

/// Output shape for history lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryFormat {
    /// `SpMSBSummaries` XML document.
    #[default]
    Xml,
    /// JSON array of timelines.
    Data,
}

type MsbUseCases<'conn> = MsbService<
    SqliteMsbRepository<'conn>,
    SqliteDoneRepository<'conn>,
    SqliteUserRepository<'conn>,
>;

type ProgramUseCases<'conn> =
    ProgramService<SqliteMsbRepository<'conn>, SqliteProjectRepository<'conn>>;

/// Entry point for remote callers, bound to one configuration.
#[derive(Debug, Clone)]
pub struct MsbServer {
    config: OmpConfig,
}

impl MsbServer {
    pub fn new(config: OmpConfig) -> Self {
        Self { config }
    }

    /// Server configured from `OMP_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(OmpConfig::from_env())
    }

    pub fn config(&self) -> &OmpConfig {
        &self.config
    }

    /// Starts file logging when the config names a log directory.
    ///
    /// Returns `Ok(false)` when file logging is disabled.
    pub fn init_logging(&self) -> Result<bool, String> {
        init_from_config(&self.config)
    }

    /// Returns the `SpProg` document holding one MSB, or `None` when no MSB
    /// has this checksum.
    pub fn fetch_msb(&self, checksum: &str, project_id: Option<&str>) -> ApiResult<Option<String>> {
        let params = log_params(&[
            ("checksum", checksum),
            ("project", project_id.unwrap_or("")),
        ]);
        self.call("fetch_msb", &params, |conn| {
            let fetched = self.msb_service(conn)?.fetch_msb(checksum, project_id)?;
            Ok(fetched.map(|fetched| fetched.xml))
        })
    }

    /// Runs an `MSBQuery` document and returns a `QueryResult` document.
    ///
    /// `max_count` of zero applies the configured default cap; negative is
    /// unlimited.
    pub fn query_msb(&self, query_xml: &str, max_count: i64) -> ApiResult<String> {
        let params = log_params(&[
            ("max_count", max_count.to_string().as_str()),
            ("query_bytes", query_xml.len().to_string().as_str()),
        ]);
        self.call("query_msb", &params, |conn| {
            let outcome = self.msb_service(conn)?.query(query_xml, max_count)?;
            query_result_document(&outcome.query, &outcome.summaries).map_err(fatal)
        })
    }

    /// Marks one repeat observed. A missing MSB is logged and ignored.
    pub fn done_msb(&self, request: &MsbActionRequest) -> ApiResult<()> {
        self.transition("done_msb", Transition::Done, request)
    }

    pub fn undo_msb(&self, request: &MsbActionRequest) -> ApiResult<()> {
        self.transition("undo_msb", Transition::Undo, request)
    }

    pub fn suspend_msb(&self, request: &MsbActionRequest, label: &str) -> ApiResult<()> {
        let transition = Transition::Suspend {
            label: label.to_string(),
        };
        self.transition("suspend_msb", transition, request)
    }

    pub fn alldone_msb(&self, request: &MsbActionRequest) -> ApiResult<()> {
        self.transition("alldone_msb", Transition::AllDone, request)
    }

    /// Records a rejected attempt; the program is untouched.
    pub fn reject_msb(&self, request: &MsbActionRequest) -> ApiResult<()> {
        self.transition("reject_msb", Transition::Reject, request)
    }

    /// Adds a free-form comment; `request.reason` is the comment text.
    pub fn comment_msb(&self, request: &MsbActionRequest) -> ApiResult<()> {
        self.call("comment_msb", &action_params(request), |conn| {
            self.msb_service(conn)?.comment(request)?;
            Ok(())
        })
    }

    /// Returns history for a project, one MSB, or both filters combined.
    pub fn history_msb(
        &self,
        project_id: Option<&str>,
        checksum: Option<&str>,
        format: HistoryFormat,
    ) -> ApiResult<String> {
        let params = log_params(&[
            ("project", project_id.unwrap_or("")),
            ("checksum", checksum.unwrap_or("")),
            ("format", format.as_str()),
        ]);
        self.call("history_msb", &params, |conn| {
            let histories = history_service(conn)?.history_for(project_id, checksum)?;
            render_histories(&histories, format)
        })
    }

    /// Returns the timeline grouped under one transaction id, if any entry
    /// carries it.
    pub fn history_for_transaction(
        &self,
        transaction_id: &str,
        format: HistoryFormat,
    ) -> ApiResult<Option<String>> {
        let params = log_params(&[("transaction", transaction_id), ("format", format.as_str())]);
        self.call("history_for_transaction", &params, |conn| {
            let Some(history) = history_service(conn)?.history_for_transaction(transaction_id)?
            else {
                return Ok(None);
            };
            render_histories(std::slice::from_ref(&history), format).map(Some)
        })
    }

    /// Returns MSBs with activity on one UT date.
    pub fn observed_msbs(&self, query: &ObservedQuery, format: HistoryFormat) -> ApiResult<String> {
        let params = log_params(&[
            ("project", query.project_id.as_deref().unwrap_or("")),
            ("date", query.date.as_deref().unwrap_or("")),
            ("use_now", query.use_now.to_string().as_str()),
            ("format", format.as_str()),
        ]);
        self.call("observed_msbs", &params, |conn| {
            let histories = history_service(conn)?.observed(query)?;
            render_histories(&histories, format)
        })
    }

    /// Returns total and active MSB counts keyed by project id.
    pub fn get_msb_count(&self, project_ids: &[String]) -> ApiResult<BTreeMap<String, MsbCount>> {
        let params = log_params(&[("projects", project_ids.join(",").as_str())]);
        self.call("get_msb_count", &params, |conn| {
            let counts = self.msb_service(conn)?.msb_counts(project_ids)?;
            Ok(counts
                .into_iter()
                .map(|count| (count.project_id.clone(), count))
                .collect())
        })
    }

    /// Stores a submitted program (plain or gzip) and returns a summary line
    /// with the new version token.
    pub fn store_program(
        &self,
        payload: &[u8],
        password: &str,
        force: bool,
        expected_version: Option<ProgramVersion>,
    ) -> ApiResult<(String, ProgramVersion)> {
        let params = log_params(&[
            ("payload_bytes", payload.len().to_string().as_str()),
            ("force", force.to_string().as_str()),
            (
                "expected_version",
                expected_version
                    .map(|version| version.to_string())
                    .unwrap_or_default()
                    .as_str(),
            ),
        ]);
        self.call("store_program", &params, |conn| {
            let outcome =
                self.program_service(conn)?
                    .store_program(payload, password, force, expected_version)?;
            Ok((outcome.summary, outcome.version))
        })
    }

    /// Returns the stored program document encoded per `format`.
    pub fn fetch_program(
        &self,
        project_id: &str,
        password: &str,
        format: ReturnFormat,
    ) -> ApiResult<(Payload, ProgramVersion)> {
        let params = log_params(&[("project", project_id), ("format", format!("{format:?}").as_str())]);
        self.call("fetch_program", &params, |conn| {
            let fetched = self
                .program_service(conn)?
                .fetch_program(project_id, password, format)?;
            Ok((fetched.payload, fetched.version))
        })
    }

    pub fn add_project(&self, project: &Project, password: &str) -> ApiResult<()> {
        let params = log_params(&[("project", project.project_id.as_str())]);
        self.call("add_project", &params, |conn| {
            Ok(self.program_service(conn)?.add_project(project, password)?)
        })
    }

    pub fn add_user(&self, user: &User) -> ApiResult<()> {
        let params = log_params(&[("user", user.user_id.as_str())]);
        self.call("add_user", &params, |conn| {
            Ok(SqliteUserRepository::try_new(conn)?.add_user(user)?)
        })
    }

    fn transition(
        &self,
        operation: &'static str,
        transition: Transition,
        request: &MsbActionRequest,
    ) -> ApiResult<()> {
        self.call(operation, &action_params(request), |conn| {
            self.msb_service(conn)?.apply(transition, request)?;
            Ok(())
        })
    }

    fn call<T>(
        &self,
        operation: &'static str,
        params: &str,
        f: impl FnOnce(&Connection) -> ApiResult<T>,
    ) -> ApiResult<T> {
        let started = Instant::now();
        let result = open_db_from_config(&self.config)
            .map_err(OmpError::from)
            .and_then(|conn| f(&conn));
        let duration_ms = started.elapsed().as_millis();
        match &result {
            Ok(_) => log::info!(
                "event=api_call module=api operation={operation} {params} status=ok duration_ms={duration_ms}"
            ),
            Err(err) => log::warn!(
                "event=api_call module=api operation={operation} {params} status=error error_kind={} duration_ms={duration_ms}",
                err.kind
            ),
        }
        result
    }

    fn msb_service<'conn>(&self, conn: &'conn Connection) -> ApiResult<MsbUseCases<'conn>> {
        Ok(MsbService::new(
            self.msb_repository(conn)?,
            SqliteDoneRepository::try_new(conn)?,
            SqliteUserRepository::try_new(conn)?,
        ))
    }

    fn program_service<'conn>(&self, conn: &'conn Connection) -> ApiResult<ProgramUseCases<'conn>> {
        Ok(ProgramService::new(
            self.msb_repository(conn)?,
            SqliteProjectRepository::try_new(conn)?,
            self.config.compression_threshold_bytes,
        ))
    }

    fn msb_repository<'conn>(&self, conn: &'conn Connection) -> ApiResult<SqliteMsbRepository<'conn>> {
        Ok(SqliteMsbRepository::try_new(conn)?
            .with_settings(MsbStoreSettings::from_config(&self.config)))
    }
}

impl HistoryFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Xml => "xml",
            Self::Data => "data",
        }
    }
}

/// Renders `key=value` pairs for the `api_call` line. Blank values render as
/// `-` and inner whitespace as `_`, so every pair stays one token.
fn log_params(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            let value = value.trim();
            if value.is_empty() {
                format!("{key}=-")
            } else {
                format!("{key}={}", value.replace(char::is_whitespace, "_"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn action_params(request: &MsbActionRequest) -> String {
    log_params(&[
        ("project", request.project_id.as_str()),
        ("checksum", request.checksum.as_str()),
        ("author", request.author.as_deref().unwrap_or("")),
        ("transaction", request.transaction_id.as_deref().unwrap_or("")),
    ])
}

fn history_service(conn: &Connection) -> ApiResult<HistoryService<SqliteDoneRepository<'_>>> {
    Ok(HistoryService::new(SqliteDoneRepository::try_new(conn)?))
}

fn render_histories(histories: &[MsbHistory], format: HistoryFormat) -> ApiResult<String> {
    match format {
        HistoryFormat::Xml => history_document(histories).map_err(fatal),
        HistoryFormat::Data => serde_json::to_string(histories).map_err(fatal),
    }
}

fn fatal(err: impl std::fmt::Display) -> OmpError {
    OmpError::new(ErrorKind::StorageFatal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::{action_params, log_params, HistoryFormat, MsbServer};
    use crate::error::ErrorKind;
    use omp_core::payload::compress;
    use omp_core::{MsbActionRequest, ObservedQuery, OmpConfig, Payload, Project, ReturnFormat, User};
    use tempfile::TempDir;

    const PROGRAM: &str = r#"<?xml version="1.0"?>
<SpProg>
  <projectID>M01BU53</projectID>
  <SpMSB remaining="2">
    <title>Mars 850</title>
    <priority>1</priority>
    <SpObs label="obs1"><instrument>SCUBA</instrument><target>Mars</target><waveband>850</waveband></SpObs>
  </SpMSB>
  <SpMSB remaining="1">
    <title>Jupiter 450</title>
    <priority>2</priority>
    <SpObs label="obs1"><instrument>SCUBA</instrument><target>Jupiter</target><waveband>450</waveband></SpObs>
  </SpMSB>
</SpProg>"#;

    fn server(dir: &TempDir) -> MsbServer {
        let config = OmpConfig::default().with_db_path(dir.path().join("omp.sqlite3"));
        let server = MsbServer::new(config);
        server
            .add_project(&Project::new("m01bu53", "Mars mapping"), "pw")
            .unwrap();
        server.add_user(&User::new("jdoe", "Jane Doe")).unwrap();
        server
    }

    fn first_checksum(server: &MsbServer) -> String {
        let result = server.query_msb("<MSBQuery/>", -1).unwrap();
        let start = result.find("checksum=\"").unwrap() + "checksum=\"".len();
        let end = start + result[start..].find('"').unwrap();
        result[start..end].to_string()
    }

    #[test]
    fn call_parameters_render_as_single_tokens() {
        assert_eq!(
            log_params(&[("max_count", "-1"), ("project", " "), ("date", "2002 03 10")]),
            "max_count=-1 project=- date=2002_03_10"
        );

        let request = MsbActionRequest::new("M01BU53", "abc123")
            .by("jdoe")
            .because("secret reason text")
            .in_transaction("tx-9");
        let params = action_params(&request);
        assert_eq!(
            params,
            "project=M01BU53 checksum=abc123 author=jdoe transaction=tx-9"
        );
        assert!(!params.contains("secret"));
    }

    #[test]
    fn store_query_done_and_history_flow() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let (summary, version) = server
            .store_program(PROGRAM.as_bytes(), "pw", false, None)
            .unwrap();
        assert!(summary.contains("M01BU53"), "{summary}");
        assert!(version > 0);

        let result = server.query_msb("<MSBQuery/>", 0).unwrap();
        assert!(result.contains("<QueryResult>"));
        assert!(result.find("Mars 850").unwrap() < result.find("Jupiter 450").unwrap());

        let checksum = first_checksum(&server);
        let request = MsbActionRequest::new("M01BU53", checksum.as_str())
            .by("jdoe")
            .in_transaction("tx-1");
        server.done_msb(&request).unwrap();

        let xml = server
            .history_msb(Some("M01BU53"), Some(&checksum), HistoryFormat::Xml)
            .unwrap();
        assert!(xml.contains("<SpMSBSummaries>"));
        assert!(xml.contains("status=\"done\""));
        assert!(xml.contains("author=\"JDOE\""));

        let data = server
            .history_msb(Some("M01BU53"), None, HistoryFormat::Data)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert!(parsed.is_array());

        assert!(server
            .history_for_transaction("tx-1", HistoryFormat::Xml)
            .unwrap()
            .is_some());
        assert!(server
            .history_for_transaction("tx-unknown", HistoryFormat::Xml)
            .unwrap()
            .is_none());

        let counts = server.get_msb_count(&["M01BU53".to_string()]).unwrap();
        let count = &counts["M01BU53"];
        assert_eq!(count.total, 2);
        assert_eq!(count.active, 2);

        let (_, unchanged) = server
            .fetch_program("M01BU53", "pw", ReturnFormat::Plain)
            .unwrap();
        assert_eq!(unchanged, version);
    }

    #[test]
    fn compressed_submissions_are_accepted() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let gz = compress(PROGRAM).unwrap();
        server.store_program(&gz, "pw", false, None).unwrap();

        let (payload, _) = server
            .fetch_program("M01BU53", "pw", ReturnFormat::Compressed)
            .unwrap();
        assert!(matches!(payload, Payload::Gzip(_)));
        assert!(payload.into_text().unwrap().contains("Mars 850"));
    }

    #[test]
    fn stale_version_is_a_concurrency_conflict() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let (_, first) = server
            .store_program(PROGRAM.as_bytes(), "pw", false, None)
            .unwrap();
        server
            .store_program(PROGRAM.as_bytes(), "pw", false, Some(first))
            .unwrap();

        let err = server
            .store_program(PROGRAM.as_bytes(), "pw", false, Some(first))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConcurrencyConflict);

        server
            .store_program(PROGRAM.as_bytes(), "pw", true, Some(first))
            .unwrap();
    }

    #[test]
    fn failures_map_to_caller_kinds() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let err = server
            .fetch_program("M01BU53", "pw", ReturnFormat::Auto)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = server
            .store_program(PROGRAM.as_bytes(), "wrong", false, None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);

        let err = server.query_msb("<MSBQuery><bogus/></MSBQuery>", 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedQuery);

        let err = server
            .observed_msbs(&ObservedQuery::default(), HistoryFormat::Xml)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedQuery);
    }

    #[test]
    fn missing_msbs_are_not_errors() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .store_program(PROGRAM.as_bytes(), "pw", false, None)
            .unwrap();

        assert_eq!(server.fetch_msb("0000", None).unwrap(), None);
        server
            .done_msb(&MsbActionRequest::new("M01BU53", "0000"))
            .unwrap();
    }

    #[test]
    fn suspend_and_reject_follow_transition_rules() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .store_program(PROGRAM.as_bytes(), "pw", false, None)
            .unwrap();
        let checksum = first_checksum(&server);
        let request = MsbActionRequest::new("M01BU53", checksum.as_str());

        server.reject_msb(&request).unwrap();
        server.suspend_msb(&request, "obs1").unwrap();

        server.alldone_msb(&request).unwrap();
        let err = server.suspend_msb(&request, "obs1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);

        let fetched = server.fetch_msb(&checksum, Some("M01BU53")).unwrap().unwrap();
        assert!(fetched.contains("Mars 850"));
    }

    #[test]
    fn comments_require_known_authors() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .store_program(PROGRAM.as_bytes(), "pw", false, None)
            .unwrap();
        let checksum = first_checksum(&server);

        server
            .comment_msb(
                &MsbActionRequest::new("M01BU53", checksum.as_str())
                    .by("jdoe")
                    .because("clouds rolling in"),
            )
            .unwrap();
        let err = server
            .comment_msb(
                &MsbActionRequest::new("M01BU53", checksum.as_str())
                    .by("nobody")
                    .because("hello"),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);

        let xml = server
            .history_msb(None, Some(&checksum), HistoryFormat::Xml)
            .unwrap();
        assert!(xml.contains("clouds rolling in"));
    }
}
