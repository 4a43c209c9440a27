use super::StepKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptMethod {
    Get,
    Post,
}

impl AttemptMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptMethod::Get => "GET",
            AttemptMethod::Post => "POST",
        }
    }
}

/// One concrete HTTP shape for calling a step. `path` may contain `{inn}`.
#[derive(Debug, Clone, Copy)]
pub struct StepAttempt {
    pub label: &'static str,
    pub method: AttemptMethod,
    pub path: &'static str,
    /// Send `{ "inn": ... }` as JSON body.
    pub has_body: bool,
}

impl StepAttempt {
    const fn get(label: &'static str, path: &'static str) -> Self {
        Self {
            label,
            method: AttemptMethod::Get,
            path,
            has_body: false,
        }
    }

    const fn post(label: &'static str, path: &'static str) -> Self {
        Self {
            label,
            method: AttemptMethod::Post,
            path,
            has_body: true,
        }
    }

    /// Path with the company id substituted and percent-encoded.
    pub fn render_path(&self, company_id: &str) -> String {
        self.path
            .replace("{inn}", &urlencoding::encode(company_id))
    }
}

#[derive(Debug)]
pub struct StepDefinition {
    pub name: &'static str,
    pub primary: StepAttempt,
    pub fallbacks: &'static [StepAttempt],
}

impl StepDefinition {
    /// Primary first, then fallbacks in order.
    pub fn attempts(&self) -> impl Iterator<Item = &StepAttempt> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

static LOOKUP: StepDefinition = StepDefinition {
    name: "lookup",
    primary: StepAttempt::get("lookup card", "/v1/lookup/{inn}/card"),
    fallbacks: &[
        StepAttempt::post("lookup card (post)", "/v1/lookup/card"),
        StepAttempt::get("lookup card (query)", "/v1/lookup/card?inn={inn}"),
    ],
};

static PARSE_SITE: StepDefinition = StepDefinition {
    name: "parse_site",
    primary: StepAttempt::post("parse site", "/v1/parse-site"),
    fallbacks: &[StepAttempt::get("parse site (get)", "/v1/parse-site/{inn}")],
};

static ANALYZE_JSON: StepDefinition = StepDefinition {
    name: "analyze_json",
    primary: StepAttempt::post("analyze json", "/v1/analyze-json"),
    fallbacks: &[StepAttempt::get("analyze json (get)", "/v1/analyze-json/{inn}")],
};

static IB_MATCH: StepDefinition = StepDefinition {
    name: "ib_match",
    primary: StepAttempt::post("ib match", "/v1/ib-match"),
    fallbacks: &[
        StepAttempt::get("ib match (get)", "/v1/ib-match/{inn}"),
        StepAttempt::get("ib match (by inn)", "/v1/ib-match/by-inn?inn={inn}"),
    ],
};

static EQUIPMENT_SELECTION: StepDefinition = StepDefinition {
    name: "equipment_selection",
    primary: StepAttempt::get(
        "equipment selection",
        "/v1/equipment-selection/by-inn/{inn}",
    ),
    fallbacks: &[StepAttempt::post(
        "equipment selection (post)",
        "/v1/equipment-selection",
    )],
};

/// Whole-pipeline endpoint used by `full` mode.
pub static FULL_PIPELINE: StepDefinition = StepDefinition {
    name: "full",
    primary: StepAttempt::post("full pipeline", "/v1/pipeline/full"),
    fallbacks: &[],
};

pub fn step_definition(step: StepKey) -> &'static StepDefinition {
    match step {
        StepKey::Lookup => &LOOKUP,
        StepKey::ParseSite => &PARSE_SITE,
        StepKey::AnalyzeJson => &ANALYZE_JSON,
        StepKey::IbMatch => &IB_MATCH,
        StepKey::EquipmentSelection => &EQUIPMENT_SELECTION,
    }
}

/// A failure status that means "wrong verb or path", so the next shape is worth trying.
pub fn is_shape_mismatch(status: u16) -> bool {
    matches!(status, 404 | 405)
}
