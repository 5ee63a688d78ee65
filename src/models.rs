use std::fmt;
use std::str::FromStr;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{growing_areas, plant_list_plants, plant_lists, plants, users};

/// Stored in place of a provider image when the provider has none.
pub const DEFAULT_PLANT_IMAGE: &str = "/static/images/default-plant.png";

/// Registered user. The password column holds a bcrypt hash and is never
/// serialized.
#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = growing_areas)]
pub struct GrowingArea {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub user_id: i32,
    pub light_level: String,
    pub soil_texture: String,
    pub soil_moisture: String,
    pub soil_ph: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = growing_areas)]
pub struct NewGrowingArea {
    pub name: String,
    pub description: String,
    pub user_id: i32,
    pub light_level: String,
    pub soil_texture: String,
    pub soil_moisture: String,
    pub soil_ph: Option<f64>,
    pub notes: Option<String>,
}

/// Cached copy of a provider record. `id` is the provider's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable, Identifiable)]
#[diesel(table_name = plants)]
pub struct Plant {
    pub id: i32,
    pub slug: String,
    pub scientific_name: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = plant_lists)]
pub struct PlantList {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub user_id: i32,
    pub growing_area_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = plant_lists)]
pub struct NewPlantList {
    pub name: String,
    pub description: Option<String>,
    pub user_id: i32,
    pub growing_area_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = plant_list_plants)]
pub struct ListMembership {
    pub plant_list_id: i32,
    pub plant_id: i32,
}

/// Outcome of adding a plant to a list. Both variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipResult {
    Added,
    AlreadyPresent,
}

/// A list together with what it points at.
#[derive(Debug, Clone, Serialize)]
pub struct PlantListDetail {
    #[serde(flatten)]
    pub list: PlantList,
    pub growing_area: Option<GrowingArea>,
    pub plants: Vec<Plant>,
}

/// Declares a closed set of string values stored as TEXT.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "unknown {} {:?}, expected one of: {}",
                        $label,
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// How much direct sun a growing area receives.
    LightLevel, "light level" {
        FullSun => "full_sun",
        PartSun => "part_sun",
        PartShade => "part_shade",
        FullShade => "full_shade",
    }
);

text_enum!(
    SoilTexture, "soil texture" {
        Sand => "sand",
        SandyLoam => "sandy_loam",
        Loam => "loam",
        Silt => "silt",
        ClayLoam => "clay_loam",
        Clay => "clay",
    }
);

text_enum!(
    SoilMoisture, "soil moisture" {
        Dry => "dry",
        Medium => "medium",
        Moist => "moist",
        Wet => "wet",
    }
);
