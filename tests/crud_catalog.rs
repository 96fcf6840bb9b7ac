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

fn bootstrap(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "b1",
        "workspace.select",
        None,
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        stdin,
        reader,
        "b2",
        "auth.register",
        None,
        json!({ "name": "Root", "email": "root@school.ec", "password": "root-pass" }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "b3",
        "auth.register",
        None,
        json!({ "name": "Tere", "email": "tere@school.ec", "password": "tere-pass" }),
    );
    (
        str_at(&admin, &["token"]).to_string(),
        str_at(&teacher, &["token"]).to_string(),
        str_at(&teacher, &["user", "id"]).to_string(),
    )
}

#[test]
fn academic_years_keep_a_single_current_year() {
    let workspace = temp_dir("schoold-crud-years");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, teacher, _) = bootstrap(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "years.create",
        Some(&admin),
        json!({ "name": "2024-2025", "startDate": "2024-09-02", "endDate": "2025-07-11", "isCurrent": true }),
    );
    let first_id = str_at(&first, &["year", "id"]).to_string();
    assert_eq!(first["year"]["isCurrent"].as_bool(), Some(true));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "years.create",
        Some(&admin),
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-07-10", "isCurrent": true }),
    );
    let second_id = str_at(&second, &["year", "id"]).to_string();

    let listed = request_ok(&mut stdin, &mut reader, "3", "years.list", Some(&teacher), json!({}));
    let years = listed["years"].as_array().expect("years array");
    assert_eq!(years.len(), 2);
    // Newest first.
    assert_eq!(years[0]["id"].as_str(), Some(second_id.as_str()));
    let current: Vec<_> = years
        .iter()
        .filter(|y| y["isCurrent"].as_bool() == Some(true))
        .collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0]["id"].as_str(), Some(second_id.as_str()));

    // Flipping the flag back moves it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "years.update",
        Some(&admin),
        json!({ "yearId": first_id, "patch": { "isCurrent": true } }),
    );
    let second_now = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "years.get",
        Some(&admin),
        json!({ "yearId": second_id }),
    );
    assert_eq!(second_now["year"]["isCurrent"].as_bool(), Some(false));

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "6",
        "years.create",
        Some(&admin),
        json!({ "name": "broken", "startDate": "2025-13-01", "endDate": "2026-07-10" }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");
    let reversed = request(
        &mut stdin,
        &mut reader,
        "7",
        "years.create",
        Some(&admin),
        json!({ "name": "reversed", "startDate": "2026-07-10", "endDate": "2025-09-01" }),
    );
    assert_eq!(error_code(&reversed), "bad_params");
    let dup = request(
        &mut stdin,
        &mut reader,
        "8",
        "years.create",
        Some(&admin),
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-07-10", "isCurrent": true }),
    );
    assert_eq!(error_code(&dup), "conflict");
    // The rejected insert must not have cleared the existing current flag.
    let first_still = request_ok(
        &mut stdin,
        &mut reader,
        "8b",
        "years.get",
        Some(&admin),
        json!({ "yearId": first_id }),
    );
    assert_eq!(first_still["year"]["isCurrent"].as_bool(), Some(true));
    let by_teacher = request(
        &mut stdin,
        &mut reader,
        "9",
        "years.update",
        Some(&teacher),
        json!({ "yearId": first_id, "patch": { "name": "renamed" } }),
    );
    assert_eq!(error_code(&by_teacher), "forbidden");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "years.delete",
        Some(&admin),
        json!({ "yearId": second_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "11",
        "years.get",
        Some(&admin),
        json!({ "yearId": second_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn courses_and_students_manage_enrollment_and_cascade() {
    let workspace = temp_dir("schoold-crud-courses");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (admin, teacher, teacher_id) = bootstrap(&mut stdin, &mut reader, &workspace);

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "years.create",
        Some(&admin),
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-07-10", "isCurrent": true }),
    );
    let year_id = str_at(&year, &["year", "id"]).to_string();

    let mut student_ids = Vec::new();
    for (i, (name, code)) in [("Carla Vera", "EST-010"), ("Andres Mora", "EST-011")]
        .iter()
        .enumerate()
    {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{i}"),
            "students.create",
            Some(&admin),
            json!({ "name": name, "code": code }),
        );
        assert_eq!(s["student"]["active"].as_bool(), Some(true));
        student_ids.push(str_at(&s, &["student", "id"]).to_string());
    }
    let dup_code = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        Some(&admin),
        json!({ "name": "Someone Else", "code": "EST-010" }),
    );
    assert_eq!(error_code(&dup_code), "conflict");
    let roster = request_ok(&mut stdin, &mut reader, "2b", "students.list", Some(&teacher), json!({}));
    assert_eq!(str_at(&roster["students"][0], &["name"]), "Andres Mora");
    let one = request_ok(
        &mut stdin,
        &mut reader,
        "2c",
        "students.get",
        Some(&teacher),
        json!({ "studentId": student_ids[0] }),
    );
    assert_eq!(str_at(&one, &["student", "code"]), "EST-010");
    let teacher_create = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        Some(&teacher),
        json!({ "name": "Nope", "code": "EST-099" }),
    );
    assert_eq!(error_code(&teacher_create), "forbidden");

    let missing_teacher = request(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        Some(&admin),
        json!({ "name": "History", "gradeLevel": "9th EGB", "teacherId": "nobody" }),
    );
    assert_eq!(error_code(&missing_teacher), "not_found");

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "courses.create",
        Some(&admin),
        json!({
            "name": "Science",
            "gradeLevel": "9th EGB",
            "teacherId": teacher_id,
            "academicYearId": year_id,
            "studentIds": [student_ids[0], student_ids[1], student_ids[0]]
        }),
    );
    let course_id = str_at(&course, &["course", "id"]).to_string();
    assert_eq!(course["course"]["studentIds"].as_array().map(|a| a.len()), Some(2));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.get",
        Some(&teacher),
        json!({ "courseId": course_id }),
    );
    assert_eq!(str_at(&got, &["course", "teacher", "email"]), "tere@school.ec");
    assert_eq!(str_at(&got, &["course", "academicYear", "name"]), "2025-2026");
    // Students come back ordered by name.
    assert_eq!(str_at(&got["course"]["students"][0], &["name"]), "Andres Mora");

    let listed = request_ok(&mut stdin, &mut reader, "7", "courses.list", Some(&teacher), json!({}));
    assert_eq!(listed["courses"][0]["studentCount"].as_i64(), Some(2));
    assert_eq!(str_at(&listed["courses"][0], &["teacher", "name"]), "Tere");

    // Year is referenced by the course.
    let year_busy = request(
        &mut stdin,
        &mut reader,
        "8",
        "years.delete",
        Some(&admin),
        json!({ "yearId": year_id }),
    );
    assert_eq!(error_code(&year_busy), "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.upsert",
        Some(&teacher),
        json!({
            "studentId": student_ids[0],
            "courseId": course_id,
            "academicYearId": year_id,
            "entry": "T1",
            "scores": { "individualActivities": 9, "groupActivities": 9, "integratorProject": 9, "periodEvaluation": 9 }
        }),
    );

    // Deleting a student removes their enrollment and grades.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.delete",
        Some(&admin),
        json!({ "studentId": student_ids[0] }),
    );
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "courses.get",
        Some(&admin),
        json!({ "courseId": course_id }),
    );
    assert_eq!(after["course"]["students"].as_array().map(|a| a.len()), Some(1));
    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.listByCourse",
        Some(&admin),
        json!({ "courseId": course_id }),
    );
    assert_eq!(grades["total"].as_i64(), Some(0));

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.update",
        Some(&admin),
        json!({ "studentId": student_ids[1], "patch": { "name": "Andres Mora Ruiz", "active": false } }),
    );
    assert_eq!(str_at(&renamed, &["student", "name"]), "Andres Mora Ruiz");
    assert_eq!(renamed["student"]["active"].as_bool(), Some(false));

    // Detach the year with an explicit null; the other fields stay.
    let detached = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "courses.update",
        Some(&admin),
        json!({ "courseId": course_id, "patch": { "academicYearId": null } }),
    );
    assert!(detached["course"]["academicYearId"].is_null());
    assert_eq!(str_at(&detached, &["course", "name"]), "Science");
    assert_eq!(detached["course"]["studentIds"].as_array().map(|a| a.len()), Some(1));

    let emptied = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "courses.update",
        Some(&admin),
        json!({ "courseId": course_id, "patch": { "studentIds": [] } }),
    );
    assert_eq!(emptied["course"]["studentIds"].as_array().map(|a| a.len()), Some(0));

    // Nothing references the year any more.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "years.delete",
        Some(&admin),
        json!({ "yearId": year_id }),
    );

    let teacher_delete = request(
        &mut stdin,
        &mut reader,
        "17",
        "courses.delete",
        Some(&teacher),
        json!({ "courseId": course_id }),
    );
    assert_eq!(error_code(&teacher_delete), "forbidden");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "courses.delete",
        Some(&admin),
        json!({ "courseId": course_id }),
    );
    let missing = request(
        &mut stdin,
        &mut reader,
        "19",
        "courses.get",
        Some(&admin),
        json!({ "courseId": course_id }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
