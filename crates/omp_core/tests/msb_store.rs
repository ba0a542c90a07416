use omp_core::db::{open_db, open_db_in_memory};
use omp_core::payload::{compress, is_gzip};
use omp_core::{
    MsbRepository, MsbStoreSettings, Project, ProjectRepository, ProgramService, RepoError,
    ReturnFormat, ScienceProgram, ServiceError, SqliteMsbRepository, SqliteProjectRepository,
};
use rusqlite::Connection;

const PROGRAM: &str = r#"<?xml version="1.0"?>
<SpProg>
  <projectID>M01BU53</projectID>
  <SpMSB remaining="2">
    <title>Mars 850</title>
    <priority>1</priority>
    <SpObs><instrument>SCUBA</instrument><target>Mars</target><waveband>850</waveband></SpObs>
  </SpMSB>
</SpProg>"#;

fn register_project(conn: &Connection) {
    SqliteProjectRepository::try_new(conn)
        .unwrap()
        .add_project(&Project::new("M01BU53", "Mars mapping"), "secret")
        .unwrap();
}

fn program_service(
    conn: &Connection,
) -> ProgramService<SqliteMsbRepository<'_>, SqliteProjectRepository<'_>> {
    ProgramService::new(
        SqliteMsbRepository::try_new(conn).unwrap(),
        SqliteProjectRepository::try_new(conn).unwrap(),
        30 * 1024,
    )
}

#[test]
fn store_then_fetch_returns_program_and_summary() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    let service = program_service(&conn);

    let stored = service
        .store_program(PROGRAM.as_bytes(), "secret", false, None)
        .unwrap();
    assert_eq!(stored.project_id, "M01BU53");
    assert!(stored.summary.contains("Number of MSBs: 1 (1 observable)"));
    assert!(stored.version > 0);

    let fetched = service
        .fetch_program("m01bu53", "secret", ReturnFormat::Plain)
        .unwrap();
    assert_eq!(fetched.version, stored.version);
    let program = ScienceProgram::parse(&fetched.payload.into_text().unwrap()).unwrap();
    assert_eq!(program, ScienceProgram::parse(PROGRAM).unwrap());
}

#[test]
fn gzip_submissions_are_inflated_and_compressed_returns_requested() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    let service = program_service(&conn);

    service
        .store_program(&compress(PROGRAM).unwrap(), "secret", false, None)
        .unwrap();
    let fetched = service
        .fetch_program("M01BU53", "secret", ReturnFormat::Compressed)
        .unwrap();
    assert!(fetched.payload.is_compressed());
    assert!(fetched.payload.into_text().unwrap().contains("Mars 850"));
}

#[test]
fn wrong_password_is_an_authentication_error() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    let service = program_service(&conn);

    assert!(matches!(
        service.store_program(PROGRAM.as_bytes(), "guess", false, None),
        Err(ServiceError::Authentication(project)) if project == "M01BU53"
    ));
    assert!(matches!(
        service.fetch_program("M01BU53", "guess", ReturnFormat::Auto),
        Err(ServiceError::Authentication(_))
    ));
}

#[test]
fn fetching_a_missing_program_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    assert!(matches!(
        program_service(&conn).fetch_program("M01BU53", "secret", ReturnFormat::Auto),
        Err(ServiceError::Repo(RepoError::ProgramNotFound(_)))
    ));
}

#[test]
fn second_writer_with_stale_version_conflicts_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("omp.db");
    let program = ScienceProgram::parse(PROGRAM).unwrap();

    let first = open_db(&path).unwrap();
    register_project(&first);
    let initial = SqliteMsbRepository::try_new(&first)
        .unwrap()
        .store_program(&program, None, false)
        .unwrap();

    let second = open_db(&path).unwrap();
    let writer_a = SqliteMsbRepository::try_new(&first).unwrap();
    let writer_b = SqliteMsbRepository::try_new(&second).unwrap();
    let fetched_a = writer_a.fetch_program("M01BU53").unwrap().version;
    let fetched_b = writer_b.fetch_program("M01BU53").unwrap().version;
    assert_eq!(fetched_a, initial);
    assert_eq!(fetched_b, initial);

    let after_a = writer_a
        .store_program(&program, Some(fetched_a), false)
        .unwrap();
    assert!(after_a > initial);

    match writer_b.store_program(&program, Some(fetched_b), false) {
        Err(RepoError::VersionConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, Some(initial));
            assert_eq!(actual, after_a);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    let forced = writer_b
        .store_program(&program, Some(fetched_b), true)
        .unwrap();
    assert!(forced > after_a);
    assert_eq!(writer_a.program_version("M01BU53").unwrap(), Some(forced));
}

#[test]
fn storing_without_a_version_over_an_existing_program_conflicts() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    let repo = SqliteMsbRepository::try_new(&conn).unwrap();
    let program = ScienceProgram::parse(PROGRAM).unwrap();

    repo.store_program(&program, None, false).unwrap();
    assert!(matches!(
        repo.store_program(&program, None, false),
        Err(RepoError::VersionConflict { expected: None, .. })
    ));
}

#[test]
fn unknown_project_cannot_store() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteMsbRepository::try_new(&conn).unwrap();
    let program = ScienceProgram::parse(PROGRAM).unwrap();
    assert!(matches!(
        repo.store_program(&program, None, false),
        Err(RepoError::ProjectNotFound(id)) if id == "M01BU53"
    ));
}

#[test]
fn large_programs_are_stored_compressed() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    let repo = SqliteMsbRepository::try_new(&conn)
        .unwrap()
        .with_settings(MsbStoreSettings {
            default_max_results: 100,
            compression_threshold_bytes: 64,
        });
    let program = ScienceProgram::parse(PROGRAM).unwrap();
    repo.store_program(&program, None, false).unwrap();

    let (compressed, payload): (i64, Vec<u8>) = conn
        .query_row(
            "SELECT compressed, payload FROM science_programs WHERE project_id = 'M01BU53';",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(compressed, 1);
    assert!(is_gzip(&payload));
    assert_eq!(repo.fetch_program("M01BU53").unwrap().program, program);
}

#[test]
fn msb_counts_report_total_and_active() {
    let conn = open_db_in_memory().unwrap();
    register_project(&conn);
    let repo = SqliteMsbRepository::try_new(&conn).unwrap();
    let program = ScienceProgram::parse(
        r#"<SpProg><projectID>M01BU53</projectID>
            <SpMSB remaining="1"><title>A</title></SpMSB>
            <SpMSB remaining="0"><title>B</title></SpMSB>
            <SpMSB remaining="-1"><title>C</title></SpMSB>
        </SpProg>"#,
    )
    .unwrap();
    repo.store_program(&program, None, false).unwrap();

    let counts = repo
        .msb_counts(&["m01bu53".to_string(), "U/02B/1".to_string()])
        .unwrap();
    assert_eq!(counts[0].project_id, "M01BU53");
    assert_eq!((counts[0].total, counts[0].active), (3, 1));
    assert_eq!((counts[1].total, counts[1].active), (0, 0));
}
