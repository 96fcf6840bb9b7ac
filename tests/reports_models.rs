use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .env("SCHOOLD_JWT_SECRET", "test-secret")
        .env_remove("SCHOOLD_WORKSPACE")
        .env("RUST_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, token, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{}", value);
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn str_at<'a>(value: &'a serde_json::Value, path: &[&str]) -> &'a str {
    let mut cur = value;
    for p in path {
        cur = cur.get(*p).unwrap_or_else(|| panic!("missing {} in {}", p, value));
    }
    cur.as_str().unwrap_or_else(|| panic!("not a string at {:?}", path))
}

fn f64_at(value: &serde_json::Value, path: &[&str]) -> f64 {
    let mut cur = value;
    for p in path {
        cur = cur.get(*p).unwrap_or_else(|| panic!("missing {} in {}", p, value));
    }
    cur.as_f64().unwrap_or_else(|| panic!("not a number at {:?}", path))
}

struct Fixture {
    admin_token: String,
    teacher_token: String,
    other_token: String,
    year_id: String,
    course_id: String,
    ana_id: String,
    bruno_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        None,
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        stdin,
        reader,
        "s2",
        "auth.register",
        None,
        json!({ "name": "Root", "email": "root@school.ec", "password": "root-pass" }),
    );
    let admin_token = str_at(&admin, &["token"]).to_string();

    let teacher = request_ok(
        stdin,
        reader,
        "s3",
        "auth.register",
        None,
        json!({ "name": "Tere", "email": "tere@school.ec", "password": "tere-pass" }),
    );
    let teacher_token = str_at(&teacher, &["token"]).to_string();
    let teacher_id = str_at(&teacher, &["user", "id"]).to_string();

    let other = request_ok(
        stdin,
        reader,
        "s4",
        "auth.register",
        None,
        json!({ "name": "Otto", "email": "otto@school.ec", "password": "otto-pass" }),
    );
    let other_token = str_at(&other, &["token"]).to_string();

    let year = request_ok(
        stdin,
        reader,
        "s5",
        "years.create",
        Some(&admin_token),
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-07-10", "isCurrent": true }),
    );
    let year_id = str_at(&year, &["year", "id"]).to_string();

    let ana = request_ok(
        stdin,
        reader,
        "s6",
        "students.create",
        Some(&admin_token),
        json!({ "name": "Ana Zambrano", "code": "EST-001" }),
    );
    let ana_id = str_at(&ana, &["student", "id"]).to_string();
    let bruno = request_ok(
        stdin,
        reader,
        "s7",
        "students.create",
        Some(&admin_token),
        json!({ "name": "Bruno Alvarez", "code": "EST-002" }),
    );
    let bruno_id = str_at(&bruno, &["student", "id"]).to_string();

    let course = request_ok(
        stdin,
        reader,
        "s8",
        "courses.create",
        Some(&admin_token),
        json!({
            "name": "Mathematics",
            "gradeLevel": "8th EGB",
            "teacherId": teacher_id,
            "academicYearId": year_id,
            "studentIds": [ana_id, bruno_id]
        }),
    );
    let course_id = str_at(&course, &["course", "id"]).to_string();

    Fixture {
        admin_token,
        teacher_token,
        other_token,
        year_id,
        course_id,
        ana_id,
        bruno_id,
    }
}

fn write_scores(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    fx: &Fixture,
    id: &str,
    student_id: &str,
    entry: &str,
    scores: serde_json::Value,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "grades.upsert",
        Some(&fx.teacher_token),
        json!({
            "studentId": student_id,
            "courseId": fx.course_id,
            "academicYearId": fx.year_id,
            "entry": entry,
            "scores": scores,
        }),
    );
}

#[test]
fn trimester_model_lists_students_by_name() {
    let workspace = temp_dir("schoold-reports-trimester");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let empty = request(
        &mut stdin,
        &mut reader,
        "1",
        "reports.trimesterModel",
        Some(&fx.teacher_token),
        json!({ "courseId": fx.course_id, "trimester": "T2" }),
    );
    assert_eq!(error_code(&empty), "not_found");

    // Bruno is written first; the report still lists Ana first.
    write_scores(
        &mut stdin,
        &mut reader,
        &fx,
        "2",
        &fx.bruno_id,
        "T2",
        json!({
            "individualActivities": 6.5,
            "groupActivities": 7,
            "integratorProject": 7,
            "periodEvaluation": 7,
            "unexcusedAbsences": 3
        }),
    );
    write_scores(
        &mut stdin,
        &mut reader,
        &fx,
        "3",
        &fx.ana_id,
        "T2",
        json!({
            "individualActivities": 9,
            "groupActivities": 10,
            "integratorProject": 9.5,
            "periodEvaluation": 9,
            "qualitativeRemark": "A"
        }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.trimesterModel",
        Some(&fx.teacher_token),
        json!({ "courseId": fx.course_id, "trimester": "t2" }),
    );
    assert_eq!(str_at(&model, &["trimester"]), "T2");
    assert_eq!(str_at(&model, &["course", "name"]), "Mathematics");
    assert_eq!(str_at(&model, &["course", "teacherName"]), "Tere");
    let rows = model["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["index"].as_i64(), Some(1));
    assert_eq!(str_at(&rows[0], &["studentName"]), "Ana Zambrano");
    assert_eq!(f64_at(&rows[0], &["trimesterAverage"]), 9.38);
    assert_eq!(str_at(&rows[0], &["qualitativeRemark"]), "A");
    assert_eq!(rows[1]["index"].as_i64(), Some(2));
    assert_eq!(str_at(&rows[1], &["studentCode"]), "EST-002");
    assert_eq!(f64_at(&rows[1], &["trimesterAverage"]), 6.88);
    assert_eq!(rows[1]["unexcusedAbsences"].as_i64(), Some(3));

    // Untouched trimesters report zeros.
    let t3 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.trimesterModel",
        Some(&fx.admin_token),
        json!({ "courseId": fx.course_id, "trimester": "T3" }),
    );
    assert_eq!(f64_at(&t3["rows"][0], &["trimesterAverage"]), 0.0);

    let bad = request(
        &mut stdin,
        &mut reader,
        "6",
        "reports.trimesterModel",
        Some(&fx.teacher_token),
        json!({ "courseId": fx.course_id, "trimester": "T5" }),
    );
    assert_eq!(error_code(&bad), "bad_params");
    let foreign = request(
        &mut stdin,
        &mut reader,
        "7",
        "reports.trimesterModel",
        Some(&fx.other_token),
        json!({ "courseId": fx.course_id, "trimester": "T2" }),
    );
    assert_eq!(error_code(&foreign), "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_model_reports_trimester_or_final_summary() {
    let workspace = temp_dir("schoold-reports-student");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);
    let scores = |a: f64, b: f64, c: f64, d: f64| {
        json!({
            "individualActivities": a,
            "groupActivities": b,
            "integratorProject": c,
            "periodEvaluation": d
        })
    };
    write_scores(&mut stdin, &mut reader, &fx, "1", &fx.ana_id, "T1", scores(8.0, 8.0, 8.0, 8.0));
    write_scores(&mut stdin, &mut reader, &fx, "2", &fx.ana_id, "T2", scores(7.0, 7.0, 7.0, 7.0));
    write_scores(&mut stdin, &mut reader, &fx, "3", &fx.ana_id, "T3", scores(9.0, 9.0, 9.0, 9.0));
    write_scores(
        &mut stdin,
        &mut reader,
        &fx,
        "4",
        &fx.ana_id,
        "FINAL_EXAM",
        json!({ "finalExamScore": 10 }),
    );
    let params = |kind: &str| {
        json!({
            "studentId": fx.ana_id,
            "courseId": fx.course_id,
            "academicYearId": fx.year_id,
            "kind": kind,
        })
    };

    let fin = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.studentModel",
        Some(&fx.teacher_token),
        params("FINAL"),
    );
    assert_eq!(str_at(&fin, &["report", "kind"]), "FINAL");
    assert_eq!(str_at(&fin, &["student", "code"]), "EST-001");
    assert_eq!(f64_at(&fin, &["report", "trimesterAverages", "T2"]), 7.0);
    assert_eq!(f64_at(&fin, &["report", "annualTrimesterAverage"]), 8.0);
    // 8 * 0.9 + 10 * 0.1
    assert_eq!(f64_at(&fin, &["report", "promotionScore"]), 8.2);

    let t3 = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.studentModel",
        Some(&fx.admin_token),
        params("T3"),
    );
    assert_eq!(str_at(&t3, &["report", "kind"]), "T3");
    assert_eq!(f64_at(&t3, &["report", "trimester", "trimesterAverage"]), 9.0);

    let bad_kind = request(
        &mut stdin,
        &mut reader,
        "7",
        "reports.studentModel",
        Some(&fx.teacher_token),
        params("MIDTERM"),
    );
    assert_eq!(error_code(&bad_kind), "bad_params");

    // Bruno has no grade row at all.
    let no_grade = request(
        &mut stdin,
        &mut reader,
        "8",
        "reports.studentModel",
        Some(&fx.teacher_token),
        json!({
            "studentId": fx.bruno_id,
            "courseId": fx.course_id,
            "academicYearId": fx.year_id,
            "kind": "FINAL",
        }),
    );
    assert_eq!(error_code(&no_grade), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
