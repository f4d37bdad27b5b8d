//! Matchmaking over the HTTP surface.

use serde_json::{json, Value};
use warp::http::StatusCode;

use gametable_web::server::{AppContext, WebServer};

type Routes = warp::filters::BoxedFilter<(warp::reply::Response,)>;

async fn join(routes: &Routes, player_id: &str, name: &str) -> (StatusCode, Value) {
    let response = warp::test::request()
        .method("POST")
        .path("/matchmaking/join")
        .json(&json!({
            "gameType": "pawns",
            "playerCount": 2,
            "playerId": player_id,
            "playerName": name
        }))
        .reply(routes)
        .await;
    let status = response.status();
    let body: Value = serde_json::from_slice(response.body()).expect("json body");
    (status, body)
}

#[tokio::test]
async fn pairing_creates_a_playable_game() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);

    let (status, body) = join(&routes, "p1", "Alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], json!(false));
    assert_eq!(body["playersNeeded"], json!(1));

    let (status, body) = join(&routes, "p2", "Bob").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], json!(true));
    assert_eq!(body["playerPosition"], json!(2));
    let game_id = body["gameId"].as_str().expect("gameId").to_string();
    assert_eq!(body["players"], json!(["Alice", "Bob"]));

    // The first player learns the same game via status.
    let response = warp::test::request()
        .method("GET")
        .path("/matchmaking/status?playerId=p1")
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(response.body()).expect("status body");
    assert_eq!(body["matched"], json!(true));
    assert_eq!(body["gameId"], json!(game_id));
    assert_eq!(body["playerPosition"], json!(1));

    // The created game is live and seat names carried over.
    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}?player=1"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("state body");
    assert_eq!(body["state"]["players"][0]["name"], json!("Alice"));
    assert_eq!(body["state"]["players"][1]["name"], json!("Bob"));
}

#[tokio::test]
async fn leave_dequeues_and_status_is_gone() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);

    join(&routes, "p1", "Alice").await;

    let response = warp::test::request()
        .method("POST")
        .path("/matchmaking/leave")
        .json(&json!({ "playerId": "p1" }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("leave body");
    assert_eq!(body["removed"], json!(true));

    let response = warp::test::request()
        .method("GET")
        .path("/matchmaking/status?playerId=p1")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
