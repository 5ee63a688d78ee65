//! Submitted field sets and the checks that turn them into insertable rows.
//!
//! Forms arrive as loosely typed strings; everything here is pure so the
//! rules can be tested without a database.

use serde::Deserialize;

use crate::error::{Error, Result, ValidationErrors};
use crate::models::{LightLevel, NewGrowingArea, NewPlantList, SoilMoisture, SoilTexture};

pub const GROWING_AREA_NAME_MAX: usize = 40;
pub const GROWING_AREA_DESCRIPTION_MAX: usize = 200;
pub const GROWING_AREA_NOTES_MAX: usize = 400;
pub const PLANT_LIST_NAME_MAX: usize = 30;
pub const PLANT_LIST_DESCRIPTION_MAX: usize = 300;
pub const PASSWORD_MIN: usize = 6;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignupForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrowingAreaForm {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub light_level: String,
    pub soil_texture: String,
    pub soil_moisture: String,
    #[serde(default)]
    pub soil_ph: Option<NumberInput>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Numeric form field that may arrive as a JSON number or as text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumberInput {
    Number(f64),
    Text(String),
}

impl From<f64> for NumberInput {
    fn from(value: f64) -> Self {
        NumberInput::Number(value)
    }
}

impl From<&str> for NumberInput {
    fn from(value: &str) -> Self {
        NumberInput::Text(value.to_owned())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlantListForm {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub growing_area: Option<String>,
}

/// Growing-area choice on a plant list form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaSelection {
    None,
    Area(i32),
}

impl AreaSelection {
    /// `"none"`, `"0"` and blank all mean "no growing area".
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let raw = match raw.map(str::trim) {
            None | Some("") | Some("0") => return Ok(AreaSelection::None),
            Some(s) if s.eq_ignore_ascii_case("none") => return Ok(AreaSelection::None),
            Some(s) => s,
        };
        match raw.parse::<i32>() {
            Ok(id) if id > 0 => Ok(AreaSelection::Area(id)),
            _ => Err(Error::invalid(
                "growing_area",
                format!("{raw:?} is not a growing area"),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaAssignmentForm {
    #[serde(default)]
    pub growing_area: Option<String>,
}

/// Trims and turns blank strings into `None`.
fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn check_len(errors: &mut ValidationErrors, field: &'static str, value: &str, max: usize) {
    if value.chars().count() > max {
        errors.push(field, format!("must be at most {max} characters"));
    }
}

fn required<'a>(errors: &mut ValidationErrors, field: &'static str, value: &'a str) -> &'a str {
    let value = value.trim();
    if value.is_empty() {
        errors.push(field, "is required");
    }
    value
}

/// Blank text counts as absent.
fn number(
    errors: &mut ValidationErrors,
    field: &'static str,
    value: Option<&NumberInput>,
) -> Option<f64> {
    let parsed = match value? {
        NumberInput::Number(n) => Ok(*n),
        NumberInput::Text(raw) => present(Some(raw.as_str()))?.parse::<f64>(),
    };
    match parsed {
        Ok(n) if n.is_finite() => Some(n),
        _ => {
            errors.push(field, "must be a number");
            None
        }
    }
}

fn choice<T>(errors: &mut ValidationErrors, field: &'static str, value: &str) -> Option<T>
where
    T: std::str::FromStr<Err = String>,
{
    match value.parse() {
        Ok(v) => Some(v),
        Err(msg) => {
            errors.push(field, msg);
            None
        }
    }
}

impl SignupForm {
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::default();
        required(&mut errors, "username", &self.username);
        let email = required(&mut errors, "email", &self.email);
        if !email.is_empty() && !is_plausible_email(email) {
            errors.push("email", "is not a valid e-mail address");
        }
        if self.password.chars().count() < PASSWORD_MIN {
            errors.push(
                "password",
                format!("must be at least {PASSWORD_MIN} characters"),
            );
        }
        required(&mut errors, "first_name", &self.first_name);
        required(&mut errors, "last_name", &self.last_name);
        errors.finish(())
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

impl GrowingAreaForm {
    pub fn validate(&self, owner_id: i32) -> Result<NewGrowingArea> {
        let mut errors = ValidationErrors::default();

        let name = required(&mut errors, "name", &self.name);
        check_len(&mut errors, "name", name, GROWING_AREA_NAME_MAX);

        let description = present(self.description.as_deref()).unwrap_or_default();
        check_len(
            &mut errors,
            "description",
            description,
            GROWING_AREA_DESCRIPTION_MAX,
        );

        let light_level = choice::<LightLevel>(&mut errors, "light_level", &self.light_level);
        let soil_texture = choice::<SoilTexture>(&mut errors, "soil_texture", &self.soil_texture);
        let soil_moisture =
            choice::<SoilMoisture>(&mut errors, "soil_moisture", &self.soil_moisture);

        let soil_ph = number(&mut errors, "soil_ph", self.soil_ph.as_ref());

        let notes = present(self.notes.as_deref());
        if let Some(notes) = notes {
            check_len(&mut errors, "notes", notes, GROWING_AREA_NOTES_MAX);
        }

        match (light_level, soil_texture, soil_moisture) {
            (Some(light), Some(texture), Some(moisture)) if errors.is_empty() => {
                Ok(NewGrowingArea {
                    name: name.to_owned(),
                    description: description.to_owned(),
                    user_id: owner_id,
                    light_level: light.as_str().to_owned(),
                    soil_texture: texture.as_str().to_owned(),
                    soil_moisture: moisture.as_str().to_owned(),
                    soil_ph,
                    notes: notes.map(str::to_owned),
                })
            }
            _ => Err(Error::Validation(errors)),
        }
    }
}

impl PlantListForm {
    /// Checks the text fields and parses the area selection. Whether the
    /// selected area belongs to the owner is decided against the store.
    pub fn validate(&self, owner_id: i32) -> Result<(NewPlantList, AreaSelection)> {
        let mut errors = ValidationErrors::default();

        let name = required(&mut errors, "name", &self.name);
        check_len(&mut errors, "name", name, PLANT_LIST_NAME_MAX);

        let description = present(self.description.as_deref());
        if let Some(description) = description {
            check_len(
                &mut errors,
                "description",
                description,
                PLANT_LIST_DESCRIPTION_MAX,
            );
        }

        let selection = match AreaSelection::parse(self.growing_area.as_deref()) {
            Ok(selection) => selection,
            Err(Error::Validation(area_errors)) => {
                errors.extend(area_errors);
                AreaSelection::None
            }
            Err(other) => return Err(other),
        };

        let new_list = NewPlantList {
            name: name.to_owned(),
            description: description.map(str::to_owned),
            user_id: owner_id,
            growing_area_id: match selection {
                AreaSelection::None => None,
                AreaSelection::Area(id) => Some(id),
            },
        };
        errors.finish((new_list, selection))
    }
}
