use diesel::prelude::*;

use crate::auth::{authorize, Principal};
use crate::error::{Error, Result};
use crate::forms::{AreaSelection, GrowingAreaForm, PlantListForm, SignupForm};
use crate::models::{
    self, GrowingArea, ListMembership, MembershipResult, Plant, PlantList, PlantListDetail, User,
};
use crate::provider::PlantRecord;

/// Register a new user with a bcrypt-hashed password.
pub fn signup(conn: &mut SqliteConnection, form: &SignupForm, cost: u32) -> Result<User> {
    use crate::schema::users::dsl::*;

    form.validate()?;
    let hashed = bcrypt::hash(&form.password, cost)?;
    let new_user = models::NewUser {
        email: form.email.trim().to_owned(),
        username: form.username.trim().to_owned(),
        first_name: form.first_name.trim().to_owned(),
        last_name: form.last_name.trim().to_owned(),
        password: hashed,
    };

    let user = diesel::insert_into(users)
        .values(&new_user)
        .returning(User::as_returning())
        .get_result(conn)?;
    tracing::info!(user = %user.username, id = user.id, "user signed up");
    Ok(user)
}

/// Find the user with `name` whose password matches. `None` covers both an
/// unknown user and a wrong password.
pub fn authenticate(conn: &mut SqliteConnection, name: &str, pass: &str) -> Result<Option<User>> {
    use crate::schema::users::dsl::*;

    let user = users
        .filter(username.eq(name.trim()))
        .select(User::as_select())
        .first(conn)
        .optional()?;

    match user {
        Some(user) if bcrypt::verify(pass, &user.password)? => Ok(Some(user)),
        _ => Ok(None),
    }
}

/// Remove the principal's account; owned areas, lists and memberships go with it.
pub fn delete_user(conn: &mut SqliteConnection, principal: &Principal, uid: i32) -> Result<()> {
    use crate::schema::users::dsl::*;

    authorize(principal, uid)?;
    let deleted = diesel::delete(users.find(uid)).execute(conn)?;
    if deleted == 0 {
        return Err(Error::NotFound("user"));
    }
    tracing::info!(user = %principal.username, "user deleted");
    Ok(())
}

/// Make sure a local row exists for the provider record and return it.
///
/// An existing row wins over the incoming record: nothing is overwritten.
/// A row inserted concurrently under the same id counts as existing.
pub fn ensure_cached(conn: &mut SqliteConnection, record: &PlantRecord) -> Result<Plant> {
    use crate::schema::plants::dsl::*;

    let new_plant = Plant {
        id: record.id,
        slug: record.slug.clone(),
        scientific_name: record.scientific_name.clone(),
        image_url: record
            .image_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| models::DEFAULT_PLANT_IMAGE.to_owned()),
    };
    let inserted = diesel::insert_into(plants)
        .values(&new_plant)
        .on_conflict(id)
        .do_nothing()
        .execute(conn)?;
    if inserted == 1 {
        tracing::debug!(plant_id = new_plant.id, slug = %new_plant.slug, "cached plant");
        return Ok(new_plant);
    }

    Ok(plants
        .find(record.id)
        .select(Plant::as_select())
        .first(conn)?)
}

/// Add a provider plant to one of the principal's lists.
pub fn add_plant_to_list(
    conn: &mut SqliteConnection,
    principal: &Principal,
    list_id: i32,
    record: &PlantRecord,
) -> Result<MembershipResult> {
    let list = find_plant_list(conn, list_id)?;
    authorize(principal, list.user_id)?;

    let result = cache_and_attach(conn, list_id, record).map_err(|err| {
        tracing::error!(list_id, plant_id = record.id, error = %err, "adding plant failed, rolled back");
        err
    })?;
    tracing::info!(list_id, plant_id = record.id, ?result, "plant added to list");
    Ok(result)
}

/// Cache upsert and membership insert as one transaction. The write lock is
/// taken up front so concurrent writers queue on the busy timeout instead of
/// failing a lock upgrade.
pub(crate) fn cache_and_attach(
    conn: &mut SqliteConnection,
    list_id: i32,
    record: &PlantRecord,
) -> Result<MembershipResult> {
    use crate::schema::plant_list_plants::dsl::*;

    conn.immediate_transaction::<_, Error, _>(|conn| {
        let plant = ensure_cached(conn, record)?;

        let existing = plant_list_plants
            .find((list_id, plant.id))
            .select((plant_list_id, plant_id))
            .first::<(i32, i32)>(conn)
            .optional()?;
        if existing.is_some() {
            return Ok(MembershipResult::AlreadyPresent);
        }

        diesel::insert_into(plant_list_plants)
            .values(&ListMembership {
                plant_list_id: list_id,
                plant_id: plant.id,
            })
            .execute(conn)?;
        Ok(MembershipResult::Added)
    })
}

/// Drop a plant from a list. The cached plant stays. Returns whether a row
/// was removed.
pub fn remove_plant_from_list(
    conn: &mut SqliteConnection,
    principal: &Principal,
    list_id: i32,
    pid: i32,
) -> Result<bool> {
    use crate::schema::plant_list_plants::dsl::*;

    let list = find_plant_list(conn, list_id)?;
    authorize(principal, list.user_id)?;

    let removed = diesel::delete(plant_list_plants.find((list_id, pid))).execute(conn)?;
    Ok(removed > 0)
}

pub fn create_growing_area(
    conn: &mut SqliteConnection,
    principal: &Principal,
    owner_id: i32,
    form: &GrowingAreaForm,
) -> Result<GrowingArea> {
    use crate::schema::growing_areas::dsl::*;

    authorize(principal, owner_id)?;
    let new_area = form.validate(owner_id)?;

    let area = conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(growing_areas)
            .values(&new_area)
            .returning(GrowingArea::as_returning())
            .get_result(conn)
    })?;
    tracing::info!(area_id = area.id, user = %principal.username, "growing area created");
    Ok(area)
}

pub fn list_growing_areas(
    conn: &mut SqliteConnection,
    principal: &Principal,
    owner_id: i32,
) -> Result<Vec<GrowingArea>> {
    use crate::schema::growing_areas::dsl::*;

    authorize(principal, owner_id)?;
    Ok(growing_areas
        .filter(user_id.eq(owner_id))
        .order(id.asc())
        .select(GrowingArea::as_select())
        .load(conn)?)
}

pub fn find_growing_area(conn: &mut SqliteConnection, area_id: i32) -> Result<GrowingArea> {
    use crate::schema::growing_areas::dsl::*;

    growing_areas
        .find(area_id)
        .select(GrowingArea::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::NotFound("growing area"))
}

/// Lists pointing at the area lose their association.
pub fn delete_growing_area(
    conn: &mut SqliteConnection,
    principal: &Principal,
    area_id: i32,
) -> Result<()> {
    use crate::schema::growing_areas::dsl::*;

    let area = find_growing_area(conn, area_id)?;
    authorize(principal, area.user_id)?;
    diesel::delete(growing_areas.find(area_id)).execute(conn)?;
    Ok(())
}

/// Resolve an area choice for `principal`: the area must exist and be theirs.
fn owned_area(
    conn: &mut SqliteConnection,
    principal: &Principal,
    selection: AreaSelection,
) -> Result<Option<i32>> {
    match selection {
        AreaSelection::None => Ok(None),
        AreaSelection::Area(area_id) => {
            let area = find_growing_area(conn, area_id).map_err(|err| match err {
                Error::NotFound(_) => Error::invalid("growing_area", "unknown growing area"),
                other => other,
            })?;
            authorize(principal, area.user_id)?;
            Ok(Some(area.id))
        }
    }
}

pub fn create_plant_list(
    conn: &mut SqliteConnection,
    principal: &Principal,
    owner_id: i32,
    form: &PlantListForm,
) -> Result<PlantList> {
    use crate::schema::plant_lists::dsl::*;

    authorize(principal, owner_id)?;
    let (mut new_list, selection) = form.validate(owner_id)?;

    let list = conn.immediate_transaction::<_, Error, _>(|conn| {
        new_list.growing_area_id = owned_area(conn, principal, selection)?;
        Ok(diesel::insert_into(plant_lists)
            .values(&new_list)
            .returning(PlantList::as_returning())
            .get_result(conn)?)
    })?;
    tracing::info!(list_id = list.id, user = %principal.username, "plant list created");
    Ok(list)
}

/// Attach a list to one of the owner's growing areas, or detach it.
pub fn assign_growing_area(
    conn: &mut SqliteConnection,
    principal: &Principal,
    list_id: i32,
    selection: AreaSelection,
) -> Result<PlantList> {
    use crate::schema::plant_lists::dsl::*;

    let list = find_plant_list(conn, list_id)?;
    authorize(principal, list.user_id)?;

    conn.immediate_transaction::<_, Error, _>(|conn| {
        let area = owned_area(conn, principal, selection)?;
        Ok(diesel::update(plant_lists.find(list_id))
            .set(growing_area_id.eq(area))
            .returning(PlantList::as_returning())
            .get_result(conn)?)
    })
}

pub fn find_plant_list(conn: &mut SqliteConnection, list_id: i32) -> Result<PlantList> {
    use crate::schema::plant_lists::dsl::*;

    plant_lists
        .find(list_id)
        .select(PlantList::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::NotFound("plant list"))
}

pub fn list_plant_lists(
    conn: &mut SqliteConnection,
    principal: &Principal,
    owner_id: i32,
) -> Result<Vec<PlantList>> {
    use crate::schema::plant_lists::dsl::*;

    authorize(principal, owner_id)?;
    Ok(plant_lists
        .filter(user_id.eq(owner_id))
        .order(id.asc())
        .select(PlantList::as_select())
        .load(conn)?)
}

/// A list with its growing area and member plants, sorted by scientific name.
pub fn plant_list_detail(
    conn: &mut SqliteConnection,
    principal: &Principal,
    list_id: i32,
) -> Result<PlantListDetail> {
    use crate::schema::{plant_list_plants, plants};

    let list = find_plant_list(conn, list_id)?;
    authorize(principal, list.user_id)?;

    let growing_area = match list.growing_area_id {
        Some(area_id) => Some(find_growing_area(conn, area_id)?),
        None => None,
    };

    let members = plant_list_plants::table
        .inner_join(plants::table)
        .filter(plant_list_plants::plant_list_id.eq(list_id))
        .order(plants::scientific_name.asc())
        .select(Plant::as_select())
        .load(conn)?;

    Ok(PlantListDetail {
        list,
        growing_area,
        plants: members,
    })
}

pub fn delete_plant_list(
    conn: &mut SqliteConnection,
    principal: &Principal,
    list_id: i32,
) -> Result<()> {
    use crate::schema::plant_lists::dsl::*;

    let list = find_plant_list(conn, list_id)?;
    authorize(principal, list.user_id)?;
    diesel::delete(plant_lists.find(list_id)).execute(conn)?;
    Ok(())
}
