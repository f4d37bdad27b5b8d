//! Lobby lifecycle over the HTTP surface: claim, ready gate, start.

use serde_json::{json, Value};
use warp::http::StatusCode;

use gametable_web::server::{AppContext, WebServer};

type Routes = warp::filters::BoxedFilter<(warp::reply::Response,)>;

async fn create_lobby_game(routes: &Routes) -> String {
    let response = warp::test::request()
        .method("POST")
        .path("/games")
        .json(&json!({
            "gameType": "pawns",
            "playerCount": 2,
            "useLobby": true,
            "creatorId": "p1",
            "playerConfigs": [ { "isAi": false }, { "isAi": false } ],
            "seed": 3
        }))
        .reply(routes)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = serde_json::from_slice(response.body()).expect("json body");
    assert_eq!(body["lobby"]["slots"].as_array().expect("slots").len(), 2);
    body["gameId"].as_str().expect("gameId").to_string()
}

async fn post(routes: &Routes, path: &str, body: Value) -> (StatusCode, Value) {
    let response = warp::test::request()
        .method("POST")
        .path(path)
        .json(&body)
        .reply(routes)
        .await;
    let status = response.status();
    let body: Value = serde_json::from_slice(response.body()).expect("json body");
    (status, body)
}

#[tokio::test]
async fn ready_gate_blocks_start_until_everyone_is_in() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_lobby_game(&routes).await;

    let (status, body) = post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p1", "seat": 1, "name": "A" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lobby"]["slots"][0]["status"], json!("claimed"));

    // Not everyone is seated: start is a conflict.
    let (status, body) =
        post(&routes, &format!("/games/{game_id}/start"), json!({ "playerId": "p1" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["errorCode"], json!("CONFLICT"));

    post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p2", "seat": 2, "name": "B" }),
    )
    .await;
    post(
        &routes,
        &format!("/games/{game_id}/set-ready"),
        json!({ "playerId": "p1", "ready": true }),
    )
    .await;
    post(
        &routes,
        &format!("/games/{game_id}/set-ready"),
        json!({ "playerId": "p2", "ready": true }),
    )
    .await;

    let (status, body) =
        post(&routes, &format!("/games/{game_id}/start"), json!({ "playerId": "p1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flowState"]["phase"], json!("playing"));

    // The lobby is gone; the session serves game state now.
    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}/lobby"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}?player=1"))
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(response.body()).expect("state body");
    assert_eq!(body["state"]["players"][0]["name"], json!("A"));
    assert_eq!(body["state"]["phase"], json!("playing"));
}

#[tokio::test]
async fn claimed_slot_conflicts_and_kick_frees_it() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_lobby_game(&routes).await;

    post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p1", "seat": 1, "name": "A" }),
    )
    .await;
    post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p2", "seat": 2, "name": "B" }),
    )
    .await;

    let (status, body) = post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p3", "seat": 2, "name": "C" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["errorCode"], json!("CONFLICT"));

    // Only the host may kick, and not itself.
    let (status, _) = post(
        &routes,
        &format!("/games/{game_id}/kick-player"),
        json!({ "playerId": "p2", "seat": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = post(
        &routes,
        &format!("/games/{game_id}/kick-player"),
        json!({ "playerId": "p1", "seat": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lobby"]["slots"][1]["status"], json!("open"));

    // The freed seat can be claimed again.
    let (status, _) = post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p3", "seat": 2, "name": "C" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn slot_management_and_ai_config() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_lobby_game(&routes).await;

    post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p1", "seat": 1, "name": "A" }),
    )
    .await;

    // Host fills seat 2 with a hard AI and starts alone.
    let (status, body) = post(
        &routes,
        &format!("/games/{game_id}/set-slot-ai"),
        json!({ "playerId": "p1", "seat": 2, "isAi": true, "aiLevel": "hard" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lobby"]["slots"][1]["status"], json!("ai"));
    assert_eq!(body["lobby"]["slots"][1]["ready"], json!(true));

    post(
        &routes,
        &format!("/games/{game_id}/set-ready"),
        json!({ "playerId": "p1", "ready": true }),
    )
    .await;
    let (status, body) =
        post(&routes, &format!("/games/{game_id}/start"), json!({ "playerId": "p1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["players"][1]["isAi"], json!(true));
}

#[tokio::test]
async fn color_clash_is_a_conflict() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_lobby_game(&routes).await;

    post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p1", "seat": 1, "name": "A" }),
    )
    .await;
    post(
        &routes,
        &format!("/games/{game_id}/claim-position"),
        json!({ "playerId": "p2", "seat": 2, "name": "B" }),
    )
    .await;

    let (status, _) = post(
        &routes,
        &format!("/games/{game_id}/player-options"),
        json!({ "playerId": "p1", "playerOptions": { "color": "red" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &routes,
        &format!("/games/{game_id}/player-options"),
        json!({ "playerId": "p2", "playerOptions": { "color": "red" } }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["errorCode"], json!("CONFLICT"));
}

#[tokio::test]
async fn game_options_validate_against_the_definition() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_lobby_game(&routes).await;

    let (status, _) = post(
        &routes,
        &format!("/games/{game_id}/game-options"),
        json!({ "playerId": "p1", "gameOptions": { "trackLen": 12 } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &routes,
        &format!("/games/{game_id}/game-options"),
        json!({ "playerId": "p1", "gameOptions": { "trackLen": 99 } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], json!("INVALID_ARGS"));
}
