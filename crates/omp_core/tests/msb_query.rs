use omp_core::db::open_db_in_memory;
use omp_core::{
    MsbActionRequest, MsbService, Project, ProjectRepository, QueryError, RepoError,
    ScienceProgram, ServiceError, SqliteDoneRepository, SqliteMsbRepository,
    SqliteProjectRepository, SqliteUserRepository, Transition,
};
use omp_core::{MaxResults, MsbQuery, MsbRepository};
use rusqlite::Connection;

type Service<'conn> = MsbService<
    SqliteMsbRepository<'conn>,
    SqliteDoneRepository<'conn>,
    SqliteUserRepository<'conn>,
>;

fn service(conn: &Connection) -> Service<'_> {
    MsbService::new(
        SqliteMsbRepository::try_new(conn).unwrap(),
        SqliteDoneRepository::try_new(conn).unwrap(),
        SqliteUserRepository::try_new(conn).unwrap(),
    )
}

fn store(conn: &Connection, project: Project, xml: &str) -> ScienceProgram {
    SqliteProjectRepository::try_new(conn)
        .unwrap()
        .add_project(&project, "pw")
        .unwrap();
    let program = ScienceProgram::parse(xml).unwrap();
    SqliteMsbRepository::try_new(conn)
        .unwrap()
        .store_program(&program, None, false)
        .unwrap();
    program
}

fn fifty_msbs(conn: &Connection) {
    let mut xml = String::from("<SpProg><projectID>U/02B/1</projectID>");
    for index in 0..50 {
        xml.push_str(&format!(
            "<SpMSB remaining=\"1\"><title>Field {index}</title><priority>{}</priority>\
             <SpObs><instrument>UFTI</instrument><target>F{index}</target></SpObs></SpMSB>",
            index % 7
        ));
    }
    xml.push_str("</SpProg>");
    store(conn, Project::new("U/02B/1", "Survey"), &xml);
}

const WEATHER: &str = r#"<SpProg><projectID>M01BU53</projectID>
  <SpMSB remaining="1">
    <title>Dry only</title><priority>2</priority>
    <SpSiteQualityObsComp><csoTau><min>0</min><max>0.05</max></csoTau></SpSiteQualityObsComp>
    <SpObs><instrument>SCUBA</instrument><target>Mars</target><waveband>450</waveband></SpObs>
  </SpMSB>
  <SpMSB remaining="1">
    <title>Any weather</title><priority>1</priority>
    <SpObs><instrument>SCUBA</instrument><target>Jupiter</target><waveband>850</waveband></SpObs>
  </SpMSB>
  <SpMSB remaining="1">
    <title>Wet ok</title><priority>3</priority>
    <SpSiteQualityObsComp><csoTau><min>0.08</min><max>0.2</max></csoTau></SpSiteQualityObsComp>
    <SpObs><instrument>RXA3</instrument><target>Orion</target></SpObs>
  </SpMSB>
</SpProg>"#;

fn titles(conn: &Connection, query: &str) -> Vec<String> {
    service(conn)
        .query(query, -1)
        .unwrap()
        .summaries
        .into_iter()
        .map(|summary| summary.title)
        .collect()
}

#[test]
fn max_count_zero_negative_and_positive() {
    let conn = open_db_in_memory().unwrap();
    fifty_msbs(&conn);
    let repo = SqliteMsbRepository::try_new(&conn)
        .unwrap()
        .with_settings(omp_core::MsbStoreSettings {
            default_max_results: 20,
            compression_threshold_bytes: 30 * 1024,
        });
    let query = MsbQuery::parse("<MSBQuery/>").unwrap();

    assert_eq!(repo.query_msbs(&query, MaxResults::from_count(0)).unwrap().len(), 20);
    assert_eq!(repo.query_msbs(&query, MaxResults::from_count(-1)).unwrap().len(), 50);
    assert_eq!(repo.query_msbs(&query, MaxResults::from_count(5)).unwrap().len(), 5);

    let default_cap = service(&conn).query("<MSBQuery/>", 0).unwrap();
    assert_eq!(default_cap.summaries.len(), 50);
}

#[test]
fn results_are_ordered_by_priority_then_project_and_checksum() {
    let conn = open_db_in_memory().unwrap();
    fifty_msbs(&conn);
    let summaries = service(&conn).query("<MSBQuery/>", -1).unwrap().summaries;
    let priorities: Vec<i64> = summaries.iter().filter_map(|s| s.priority).collect();
    let mut sorted = priorities.clone();
    sorted.sort_unstable();
    assert_eq!(priorities, sorted);
    assert!(summaries.iter().all(|s| s.relevance == 0.0));
}

#[test]
fn tau_feasibility_uses_the_msb_constraint_range() {
    let conn = open_db_in_memory().unwrap();
    store(&conn, Project::new("M01BU53", "Planets"), WEATHER);

    assert_eq!(
        titles(&conn, "<MSBQuery><tau>0.04</tau></MSBQuery>"),
        ["Any weather", "Dry only"]
    );
    assert_eq!(
        titles(&conn, "<MSBQuery><tau>0.1</tau></MSBQuery>"),
        ["Any weather", "Wet ok"]
    );
}

#[test]
fn feasibility_filter_applies_before_the_cap() {
    let conn = open_db_in_memory().unwrap();
    store(&conn, Project::new("M01BU53", "Planets"), WEATHER);
    let outcome = service(&conn)
        .query("<MSBQuery><tau>0.1</tau></MSBQuery>", 2)
        .unwrap();
    let titles: Vec<&str> = outcome.summaries.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, ["Any weather", "Wet ok"]);
}

#[test]
fn value_lists_or_groups_and_negation() {
    let conn = open_db_in_memory().unwrap();
    store(&conn, Project::new("M01BU53", "Planets"), WEATHER);

    assert_eq!(
        titles(
            &conn,
            "<MSBQuery><target>mars</target><target>ORION</target></MSBQuery>"
        ),
        ["Dry only", "Wet ok"]
    );
    assert_eq!(
        titles(
            &conn,
            "<MSBQuery><or><waveband>450</waveband><instrument>RXA3</instrument></or></MSBQuery>"
        ),
        ["Dry only", "Wet ok"]
    );
    assert_eq!(
        titles(&conn, "<MSBQuery><not><instrument>SCUBA</instrument></not></MSBQuery>"),
        ["Wet ok"]
    );
    assert_eq!(
        titles(
            &conn,
            "<MSBQuery><priority><min>2</min><max>1</max></priority></MSBQuery>"
        ),
        ["Any weather", "Dry only", "Wet ok"]
    );
    assert_eq!(
        titles(
            &conn,
            "<MSBQuery><priority><min>3</min><max>1</max></priority></MSBQuery>"
        ),
        ["Any weather", "Wet ok"]
    );
}

#[test]
fn text_predicates_rank_by_relevance() {
    let conn = open_db_in_memory().unwrap();
    store(&conn, Project::new("M01BU53", "Planets"), WEATHER);

    let outcome = service(&conn)
        .query("<MSBQuery><text>jupiter</text></MSBQuery>", 0)
        .unwrap();
    assert_eq!(outcome.summaries.len(), 1);
    assert_eq!(outcome.summaries[0].title, "Any weather");
    assert!(outcome.summaries[0].relevance > 0.0);

    let mut either = titles(
        &conn,
        r#"<MSBQuery><text boolean="1">mars OR orion</text></MSBQuery>"#,
    );
    either.sort();
    assert_eq!(either, ["Dry only", "Wet ok"]);
    assert_eq!(
        titles(
            &conn,
            r#"<MSBQuery><text boolean="1">scuba NOT jupiter</text></MSBQuery>"#
        ),
        ["Dry only"]
    );
}

#[test]
fn exhausted_removed_and_disabled_msbs_are_hidden_by_default() {
    let conn = open_db_in_memory().unwrap();
    let program = store(&conn, Project::new("M01BU53", "Planets"), WEATHER);
    let dry = program
        .msbs()
        .find(|msb| msb.title == "Dry only")
        .unwrap()
        .checksum
        .clone();
    service(&conn)
        .apply(Transition::Done, &MsbActionRequest::new("M01BU53", dry))
        .unwrap()
        .unwrap();

    assert_eq!(titles(&conn, "<MSBQuery/>"), ["Any weather", "Wet ok"]);
    assert_eq!(
        titles(
            &conn,
            "<MSBQuery><disableconstraint>remaining</disableconstraint></MSBQuery>"
        ),
        ["Any weather", "Dry only", "Wet ok"]
    );

    SqliteProjectRepository::try_new(&conn)
        .unwrap()
        .set_enabled("M01BU53", false)
        .unwrap();
    assert!(titles(&conn, "<MSBQuery/>").is_empty());
    assert_eq!(
        titles(
            &conn,
            "<MSBQuery><disableconstraint>state</disableconstraint></MSBQuery>"
        ),
        ["Any weather", "Wet ok"]
    );
}

#[test]
fn semester_and_country_join_project_metadata() {
    let conn = open_db_in_memory().unwrap();
    let mut project = Project::new("M01BU53", "Planets");
    project.semester = Some("01B".to_string());
    project.country = Some("UK".to_string());
    store(&conn, project, WEATHER);

    assert_eq!(titles(&conn, "<MSBQuery><semester>01b</semester></MSBQuery>").len(), 3);
    assert!(titles(&conn, "<MSBQuery><country>CA</country></MSBQuery>").is_empty());
}

#[test]
fn malformed_queries_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    for xml in [
        "<MSBQuery><telescope>JCMT</telescope></MSBQuery>",
        "<MSBQuery><or><tau>0.1</tau></or></MSBQuery>",
        "<MSBQuery><priority><min>1</min><max>2</max></priority><priority><min>5</min></priority></MSBQuery>",
        "<SpProg/>",
        "<MSBQuery><tau>",
    ] {
        assert!(
            matches!(
                service.query(xml, 0),
                Err(ServiceError::Repo(RepoError::Query(_)))
            ),
            "{xml} was accepted"
        );
    }
    assert!(matches!(
        service.query("<MSBQuery><or/></MSBQuery>", 0),
        Err(ServiceError::Repo(RepoError::Query(QueryError::EmptyGroup(_))))
    ));
}
