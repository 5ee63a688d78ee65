use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{self, Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::actions;
use crate::auth::{self, Principal, Sessions};
use crate::db::{self, DbPool};
use crate::error::{Error, GENERIC_FAILURE};
use crate::forms::{
    AreaAssignmentForm, AreaSelection, GrowingAreaForm, LoginForm, PlantListForm, SignupForm,
};
use crate::provider::{self, AdvancedFilter, Cursor, PageRequest, PlantProvider};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub provider: Arc<dyn PlantProvider>,
    pub sessions: Sessions,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddPlant {
    slug: String,
}

#[derive(Debug, Serialize)]
struct Token {
    token: Uuid,
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Resolves the bearer token to a principal or rejects with 401.
fn principal(sessions: Sessions) -> impl Filter<Extract = (Principal,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let sessions = sessions.clone();
        async move {
            sessions
                .resolve_header(header.as_deref())
                .map_err(warp::reject::custom)
        }
    })
}

pub fn api(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let signup = warp::post()
        .and(warp::path!("users"))
        .and(warp::body::json::<SignupForm>())
        .and(with_state(state.clone()))
        .and_then(handle_signup);

    let login = warp::post()
        .and(warp::path!("login"))
        .and(warp::body::json::<LoginForm>())
        .and(with_state(state.clone()))
        .and_then(handle_login);

    let logout = warp::post()
        .and(warp::path!("logout"))
        .and(warp::header::<String>("authorization"))
        .and(with_state(state.clone()))
        .and_then(handle_logout);

    let delete_user = warp::delete()
        .and(warp::path!("users" / i32))
        .and(principal(state.sessions.clone()))
        .and(with_state(state.clone()))
        .and_then(handle_delete_user);

    let search = warp::get()
        .and(warp::path!("search"))
        .and(warp::query::<SearchQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_search);

    let advanced_search = warp::post()
        .and(warp::path!("search" / "advanced"))
        .and(warp::body::json::<AdvancedFilter>())
        .and(with_state(state.clone()))
        .and_then(handle_advanced_search);

    let species = warp::get()
        .and(warp::path!("species" / String))
        .and(with_state(state.clone()))
        .and_then(handle_species);

    let list_areas = warp::get()
        .and(warp::path!("users" / i32 / "areas"))
        .and(principal(state.sessions.clone()))
        .and(with_state(state.clone()))
        .and_then(handle_list_areas);

    let create_area = warp::post()
        .and(warp::path!("users" / i32 / "areas"))
        .and(principal(state.sessions.clone()))
        .and(warp::body::json::<GrowingAreaForm>())
        .and(with_state(state.clone()))
        .and_then(handle_create_area);

    let delete_area = warp::delete()
        .and(warp::path!("areas" / i32))
        .and(principal(state.sessions.clone()))
        .and(with_state(state.clone()))
        .and_then(handle_delete_area);

    let list_lists = warp::get()
        .and(warp::path!("users" / i32 / "lists"))
        .and(principal(state.sessions.clone()))
        .and(with_state(state.clone()))
        .and_then(handle_list_lists);

    let create_list = warp::post()
        .and(warp::path!("users" / i32 / "lists"))
        .and(principal(state.sessions.clone()))
        .and(warp::body::json::<PlantListForm>())
        .and(with_state(state.clone()))
        .and_then(handle_create_list);

    let list_detail = warp::get()
        .and(warp::path!("lists" / i32))
        .and(principal(state.sessions.clone()))
        .and(with_state(state.clone()))
        .and_then(handle_list_detail);

    let delete_list = warp::delete()
        .and(warp::path!("lists" / i32))
        .and(principal(state.sessions.clone()))
        .and(with_state(state.clone()))
        .and_then(handle_delete_list);

    let assign_area = warp::put()
        .and(warp::path!("lists" / i32 / "area"))
        .and(principal(state.sessions.clone()))
        .and(warp::body::json::<AreaAssignmentForm>())
        .and(with_state(state.clone()))
        .and_then(handle_assign_area);

    let add_plant = warp::post()
        .and(warp::path!("lists" / i32 / "plants"))
        .and(principal(state.sessions.clone()))
        .and(warp::body::json::<AddPlant>())
        .and(with_state(state.clone()))
        .and_then(handle_add_plant);

    let remove_plant = warp::delete()
        .and(warp::path!("lists" / i32 / "plants" / i32))
        .and(principal(state.sessions.clone()))
        .and(with_state(state))
        .and_then(handle_remove_plant);

    let accounts = signup.or(login).or(logout).or(delete_user);
    let plants = search.or(advanced_search).or(species);
    let areas = list_areas.or(create_area).or(delete_area);
    let lists = list_lists
        .or(create_list)
        .or(list_detail)
        .or(delete_list)
        .or(assign_area)
        .or(add_plant)
        .or(remove_plant);

    accounts
        .or(plants)
        .or(areas)
        .or(lists)
        .recover(handle_rejection)
        .with(warp::trace::request())
}

type HandlerResult = Result<WithStatus<Json>, Rejection>;

fn ok<T: Serialize>(body: &T) -> HandlerResult {
    Ok(reply::with_status(reply::json(body), StatusCode::OK))
}

fn created<T: Serialize>(body: &T) -> HandlerResult {
    Ok(reply::with_status(reply::json(body), StatusCode::CREATED))
}

fn reject(err: Error) -> Rejection {
    warp::reject::custom(err)
}

async fn handle_signup(form: SignupForm, state: AppState) -> HandlerResult {
    let cost = state.bcrypt_cost;
    let user = db::run(&state.pool, move |conn| actions::signup(conn, &form, cost))
        .await
        .map_err(reject)?;
    created(&user)
}

async fn handle_login(form: LoginForm, state: AppState) -> HandlerResult {
    let user = db::run(&state.pool, move |conn| {
        actions::authenticate(conn, &form.username, &form.password)
    })
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(Error::Unauthenticated))?;
    let token = state.sessions.login(&user);
    ok(&Token { token })
}

async fn handle_logout(header: String, state: AppState) -> HandlerResult {
    let token = auth::bearer_token(Some(&header)).ok_or_else(|| reject(Error::Unauthenticated))?;
    let principal = state
        .sessions
        .resolve(token)
        .ok_or_else(|| reject(Error::Unauthenticated))?;
    state.sessions.logout(token);
    tracing::info!(user = %principal.username, "session closed");
    ok(&serde_json::json!({ "logged_out": true }))
}

async fn handle_delete_user(user_id: i32, principal: Principal, state: AppState) -> HandlerResult {
    let actor = principal.clone();
    db::run(&state.pool, move |conn| actions::delete_user(conn, &actor, user_id))
        .await
        .map_err(reject)?;
    state.sessions.forget_user(principal.user_id);
    ok(&serde_json::json!({ "deleted": user_id }))
}

async fn handle_search(query: SearchQuery, state: AppState) -> HandlerResult {
    let request = match (query.cursor, query.q) {
        (Some(cursor), _) => PageRequest::Cursor(Cursor(cursor)),
        (None, Some(term)) => PageRequest::Query(term),
        (None, None) => return Err(reject(Error::invalid("q", "enter something to search for"))),
    };
    let page = provider::fetch_page(state.provider.as_ref(), request)
        .await
        .map_err(reject)?;
    ok(&page)
}

async fn handle_advanced_search(filter: AdvancedFilter, state: AppState) -> HandlerResult {
    let page = provider::fetch_page(state.provider.as_ref(), PageRequest::Filter(filter))
        .await
        .map_err(reject)?;
    ok(&page)
}

async fn handle_species(slug: String, state: AppState) -> HandlerResult {
    let record = state.provider.species(&slug).await.map_err(reject)?;
    ok(&record)
}

async fn handle_list_areas(owner_id: i32, principal: Principal, state: AppState) -> HandlerResult {
    let areas = db::run(&state.pool, move |conn| {
        actions::list_growing_areas(conn, &principal, owner_id)
    })
    .await
    .map_err(reject)?;
    ok(&areas)
}

async fn handle_create_area(
    owner_id: i32,
    principal: Principal,
    form: GrowingAreaForm,
    state: AppState,
) -> HandlerResult {
    let area = db::run(&state.pool, move |conn| {
        actions::create_growing_area(conn, &principal, owner_id, &form)
    })
    .await
    .map_err(reject)?;
    created(&area)
}

async fn handle_delete_area(area_id: i32, principal: Principal, state: AppState) -> HandlerResult {
    db::run(&state.pool, move |conn| {
        actions::delete_growing_area(conn, &principal, area_id)
    })
    .await
    .map_err(reject)?;
    ok(&serde_json::json!({ "deleted": area_id }))
}

async fn handle_list_lists(owner_id: i32, principal: Principal, state: AppState) -> HandlerResult {
    let lists = db::run(&state.pool, move |conn| {
        actions::list_plant_lists(conn, &principal, owner_id)
    })
    .await
    .map_err(reject)?;
    ok(&lists)
}

async fn handle_create_list(
    owner_id: i32,
    principal: Principal,
    form: PlantListForm,
    state: AppState,
) -> HandlerResult {
    let list = db::run(&state.pool, move |conn| {
        actions::create_plant_list(conn, &principal, owner_id, &form)
    })
    .await
    .map_err(reject)?;
    created(&list)
}

async fn handle_list_detail(list_id: i32, principal: Principal, state: AppState) -> HandlerResult {
    let detail = db::run(&state.pool, move |conn| {
        actions::plant_list_detail(conn, &principal, list_id)
    })
    .await
    .map_err(reject)?;
    ok(&detail)
}

async fn handle_delete_list(list_id: i32, principal: Principal, state: AppState) -> HandlerResult {
    db::run(&state.pool, move |conn| {
        actions::delete_plant_list(conn, &principal, list_id)
    })
    .await
    .map_err(reject)?;
    ok(&serde_json::json!({ "deleted": list_id }))
}

async fn handle_assign_area(
    list_id: i32,
    principal: Principal,
    form: AreaAssignmentForm,
    state: AppState,
) -> HandlerResult {
    let selection = AreaSelection::parse(form.growing_area.as_deref()).map_err(reject)?;
    let list = db::run(&state.pool, move |conn| {
        actions::assign_growing_area(conn, &principal, list_id, selection)
    })
    .await
    .map_err(reject)?;
    ok(&list)
}

/// Checks the list first so a missing or foreign list never costs a provider
/// call, then looks the plant up and caches and attaches it.
async fn handle_add_plant(
    list_id: i32,
    principal: Principal,
    body: AddPlant,
    state: AppState,
) -> HandlerResult {
    let owner = principal.clone();
    db::run(&state.pool, move |conn| {
        let list = actions::find_plant_list(conn, list_id)?;
        auth::authorize(&owner, list.user_id)
    })
    .await
    .map_err(reject)?;

    let record = state.provider.species(&body.slug).await.map_err(reject)?;
    let result = db::run(&state.pool, move |conn| {
        actions::add_plant_to_list(conn, &principal, list_id, &record)
    })
    .await
    .map_err(reject)?;
    ok(&serde_json::json!({ "result": result }))
}

async fn handle_remove_plant(
    list_id: i32,
    plant_id: i32,
    principal: Principal,
    state: AppState,
) -> HandlerResult {
    let removed = db::run(&state.pool, move |conn| {
        actions::remove_plant_from_list(conn, &principal, list_id, plant_id)
    })
    .await
    .map_err(reject)?;
    ok(&serde_json::json!({ "removed": removed }))
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a [crate::error::FieldError]>,
}

/// Maps rejections onto JSON error responses.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message, fields) = if let Some(err) = rejection.find::<Error>() {
        match err {
            Error::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid input".to_owned(),
                Some(errors.fields()),
            ),
            Error::Authorization => (StatusCode::FORBIDDEN, err.to_string(), None),
            Error::Unauthenticated => (StatusCode::UNAUTHORIZED, err.to_string(), None),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string(), None),
            Error::ConstraintViolation(detail) => {
                tracing::warn!(%detail, "write rejected by the store");
                (StatusCode::CONFLICT, GENERIC_FAILURE.to_owned(), None)
            }
            Error::ExternalService(detail) => {
                tracing::warn!(%detail, "plant provider failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "the plant database is unavailable right now".to_owned(),
                    None,
                )
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE.to_owned(), None)
            }
        }
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "no such route".to_owned(), None)
    } else if rejection.find::<warp::reject::MissingHeader>().is_some() {
        (StatusCode::UNAUTHORIZED, Error::Unauthenticated.to_string(), None)
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, err.to_string(), None)
    } else if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, err.to_string(), None)
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_owned(), None)
    } else {
        tracing::error!(?rejection, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE.to_owned(), None)
    };

    let body = reply::json(&ErrorBody {
        error: &message,
        fields,
    });
    Ok(reply::with_status(body, status))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use warp::test::request;

    use super::*;
    use crate::provider::fake::{plant, FakeProvider};

    fn mints() -> Arc<FakeProvider> {
        let mut mint = plant(173, "mentha-spicata");
        mint.image_url = Some("https://images.example/mint.jpg".into());
        let catalogue = vec![
            mint,
            plant(174, "mentha-piperita"),
            plant(175, "mentha-aquatica"),
        ];
        Arc::new(FakeProvider::with(catalogue, 2))
    }

    fn state_with(provider: Arc<FakeProvider>) -> AppState {
        AppState {
            pool: db::test_pool(),
            provider,
            sessions: Sessions::default(),
            bcrypt_cost: 4,
        }
    }

    fn state() -> AppState {
        state_with(mints())
    }

    fn body(res: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    /// Signs up and logs in, returning (user id, auth header).
    async fn account<F, R>(api: &F, name: &str) -> (i64, String)
    where
        F: Filter<Extract = (R,), Error = Infallible> + 'static,
        R: Reply + Send,
    {
        let res = request()
            .method("POST")
            .path("/users")
            .json(&json!({
                "username": name,
                "email": format!("{name}@example.com"),
                "password": "photosynthesis",
                "first_name": name,
                "last_name": "Grower",
            }))
            .reply(api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let id = body(&res)["id"].as_i64().unwrap();

        let res = request()
            .method("POST")
            .path("/login")
            .json(&json!({ "username": name, "password": "photosynthesis" }))
            .reply(api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let token = body(&res)["token"].as_str().unwrap().to_owned();
        (id, format!("Bearer {token}"))
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let api = api(state());
        account(&api, "sage").await;
        let res = request()
            .method("POST")
            .path("/login")
            .json(&json!({ "username": "sage", "password": "nope-nope" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn protected_routes_need_a_session() {
        let api = api(state());
        let res = request().method("GET").path("/users/1/lists").reply(&api).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garden_flow_end_to_end() {
        let api = api(state());
        let (uid, auth) = account(&api, "basil").await;

        let res = request()
            .method("POST")
            .path(&format!("/users/{uid}/areas"))
            .header("authorization", &auth)
            .json(&json!({
                "name": "herb spiral",
                "light_level": "full_sun",
                "soil_texture": "sandy_loam",
                "soil_moisture": "dry",
                "soil_ph": 7.1,
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let area_id = body(&res)["id"].as_i64().unwrap();
        assert_eq!(body(&res)["soil_ph"], json!(7.1));

        let res = request()
            .method("POST")
            .path(&format!("/users/{uid}/lists"))
            .header("authorization", &auth)
            .json(&json!({ "name": "mints", "growing_area": area_id.to_string() }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let list_id = body(&res)["id"].as_i64().unwrap();

        for expected in ["added", "already_present"] {
            let res = request()
                .method("POST")
                .path(&format!("/lists/{list_id}/plants"))
                .header("authorization", &auth)
                .json(&json!({ "slug": "mentha-spicata" }))
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(body(&res)["result"], expected);
        }

        let res = request()
            .method("GET")
            .path(&format!("/lists/{list_id}"))
            .header("authorization", &auth)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let detail = body(&res);
        assert_eq!(detail["name"], "mints");
        assert_eq!(detail["growing_area"]["id"].as_i64(), Some(area_id));
        assert_eq!(detail["plants"].as_array().unwrap().len(), 1);
        assert_eq!(detail["plants"][0]["id"], 173);
    }

    #[tokio::test]
    async fn invalid_area_reports_every_field() {
        let api = api(state());
        let (uid, auth) = account(&api, "yarrow").await;
        let res = request()
            .method("POST")
            .path(&format!("/users/{uid}/areas"))
            .header("authorization", &auth)
            .json(&json!({
                "name": "x".repeat(41),
                "light_level": "moonlight",
                "soil_texture": "loam",
                "soil_moisture": "wet",
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let fields: Vec<_> = body(&res)["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(fields, ["name", "light_level"]);
    }

    #[tokio::test]
    async fn cannot_act_for_another_user() {
        let api = api(state());
        let (owner, _) = account(&api, "clover").await;
        let (_, intruder) = account(&api, "dock").await;

        let res = request()
            .method("POST")
            .path(&format!("/users/{owner}/lists"))
            .header("authorization", &intruder)
            .json(&json!({ "name": "stolen" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn list_is_checked_before_the_provider_is_called() {
        let provider = mints();
        let api = api(state_with(provider.clone()));
        let (owner, auth) = account(&api, "chervil").await;
        let (_, intruder) = account(&api, "nettle").await;

        let res = request()
            .method("POST")
            .path(&format!("/users/{owner}/lists"))
            .header("authorization", &auth)
            .json(&json!({ "name": "teas" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let list_id = body(&res)["id"].as_i64().unwrap();

        let res = request()
            .method("POST")
            .path("/lists/9999/plants")
            .header("authorization", &auth)
            .json(&json!({ "slug": "mentha-spicata" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = request()
            .method("POST")
            .path(&format!("/lists/{list_id}/plants"))
            .header("authorization", &intruder)
            .json(&json!({ "slug": "mentha-spicata" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert!(provider.requests.lock().unwrap().is_empty());

        let res = request()
            .method("POST")
            .path(&format!("/lists/{list_id}/plants"))
            .header("authorization", &auth)
            .json(&json!({ "slug": "mentha-spicata" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(*provider.requests.lock().unwrap(), ["species:mentha-spicata"]);
    }

    #[tokio::test]
    async fn search_pages_to_an_explicit_end() {
        let api = api(state());
        let res = request()
            .method("GET")
            .path("/search?q=mentha")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let first = body(&res);
        assert_eq!(first["records"].as_array().unwrap().len(), 2);
        assert_eq!(first["next"]["kind"], "cursor");

        let cursor = first["next"]["cursor"].as_str().unwrap();
        let path = format!(
            "/search?cursor={}",
            cursor.replace('/', "%2F").replace('?', "%3F").replace('&', "%26").replace('=', "%3D")
        );
        let res = request().method("GET").path(&path).reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
        let last = body(&res);
        assert_eq!(last["records"].as_array().unwrap().len(), 1);
        assert_eq!(last["next"]["kind"], "end_of_results");
    }

    #[tokio::test]
    async fn unknown_species_is_a_provider_error() {
        let api = api(state());
        let res = request()
            .method("GET")
            .path("/species/no-such-plant")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn logout_revokes_the_token() {
        let api = api(state());
        let (uid, auth) = account(&api, "sorrel").await;
        let res = request()
            .method("POST")
            .path("/logout")
            .header("authorization", &auth)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = request()
            .method("GET")
            .path(&format!("/users/{uid}/areas"))
            .header("authorization", &auth)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
