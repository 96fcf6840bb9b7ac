use serde::Serialize;

/// Weight of the cumulative trimester average in the promotion score.
pub const TRIMESTER_WEIGHT: f64 = 0.90;
/// Weight of the year-end exam in the promotion score.
pub const FINAL_EXAM_WEIGHT: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Trimester {
    T1,
    T2,
    T3,
}

impl Trimester {
    pub const ALL: [Trimester; 3] = [Trimester::T1, Trimester::T2, Trimester::T3];

    pub fn as_str(self) -> &'static str {
        match self {
            Trimester::T1 => "T1",
            Trimester::T2 => "T2",
            Trimester::T3 => "T3",
        }
    }

    /// Column value used by the `grade_trimesters.term` column.
    pub fn term(self) -> i64 {
        match self {
            Trimester::T1 => 1,
            Trimester::T2 => 2,
            Trimester::T3 => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "T1" => Some(Trimester::T1),
            "T2" => Some(Trimester::T2),
            "T3" => Some(Trimester::T3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterScores {
    pub individual_activities: f64,
    pub group_activities: f64,
    pub integrator_project: f64,
    pub period_evaluation: f64,
    pub trimester_average: f64,
    pub excused_absences: i64,
    pub unexcused_absences: i64,
    pub qualitative_remark: String,
}

impl TrimesterScores {
    fn components(&self) -> [f64; 4] {
        [
            self.individual_activities,
            self.group_activities,
            self.integrator_project,
            self.period_evaluation,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    #[serde(rename = "T1")]
    pub t1: TrimesterScores,
    #[serde(rename = "T2")]
    pub t2: TrimesterScores,
    #[serde(rename = "T3")]
    pub t3: TrimesterScores,
    pub final_exam_score: f64,
    pub annual_trimester_average: f64,
    pub promotion_score: f64,
}

impl GradeRecord {
    pub fn trimester(&self, t: Trimester) -> &TrimesterScores {
        match t {
            Trimester::T1 => &self.t1,
            Trimester::T2 => &self.t2,
            Trimester::T3 => &self.t3,
        }
    }

    pub fn trimester_mut(&mut self, t: Trimester) -> &mut TrimesterScores {
        match t {
            Trimester::T1 => &mut self.t1,
            Trimester::T2 => &mut self.t2,
            Trimester::T3 => &mut self.t3,
        }
    }
}

/// Two-decimal rounding, half away from zero.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Unweighted mean of the four components. A trimester whose components are
/// all exactly 0 has had nothing entered and averages to 0.
pub fn trimester_average(scores: &TrimesterScores) -> f64 {
    let parts = scores.components();
    if parts.iter().all(|v| *v == 0.0) {
        return 0.0;
    }
    round2(parts.iter().sum::<f64>() / 4.0)
}

/// Mean of the non-zero trimester averages.
///
/// NOTE: 0 doubles as "not entered", so an earned average of exactly 0 is
/// dropped from the mean instead of counting as a failing trimester. Kept
/// as-is until the grading policy says otherwise.
pub fn annual_trimester_average(averages: [f64; 3]) -> f64 {
    let entered: Vec<f64> = averages.into_iter().filter(|v| *v > 0.0).collect();
    if entered.is_empty() {
        return 0.0;
    }
    round2(entered.iter().sum::<f64>() / entered.len() as f64)
}

/// 90/10 blend of the annual average and the final exam. Only defined once
/// both are present.
pub fn promotion_score(annual_average: f64, final_exam_score: f64) -> f64 {
    if annual_average > 0.0 && final_exam_score > 0.0 {
        round2(annual_average * TRIMESTER_WEIGHT + final_exam_score * FINAL_EXAM_WEIGHT)
    } else {
        0.0
    }
}

/// Overwrites every derived field of `record` from its inputs. Must run on
/// every write, immediately before the record is stored.
pub fn recompute(mut record: GradeRecord) -> GradeRecord {
    for t in Trimester::ALL {
        let scores = record.trimester_mut(t);
        scores.trimester_average = trimester_average(scores);
    }
    record.annual_trimester_average = annual_trimester_average([
        record.t1.trimester_average,
        record.t2.trimester_average,
        record.t3.trimester_average,
    ]);
    record.promotion_score =
        promotion_score(record.annual_trimester_average, record.final_exam_score);
    record
}
