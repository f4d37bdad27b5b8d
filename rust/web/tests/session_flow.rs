//! End-to-end flows over the HTTP surface: one-shot actions, illegal
//! actions, and the multi-step selection flow.

use serde_json::{json, Value};
use warp::http::StatusCode;

use gametable_web::server::{AppContext, WebServer};

async fn create_game(routes: &warp::filters::BoxedFilter<(warp::reply::Response,)>) -> String {
    let response = warp::test::request()
        .method("POST")
        .path("/games")
        .json(&json!({
            "gameType": "pawns",
            "playerCount": 2,
            "playerNames": ["A", "B"],
            "seed": 11
        }))
        .reply(routes)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = serde_json::from_slice(response.body()).expect("json body");
    assert_eq!(body["success"], json!(true));
    body["gameId"].as_str().expect("gameId").to_string()
}

async fn history_len(
    routes: &warp::filters::BoxedFilter<(warp::reply::Response,)>,
    game_id: &str,
) -> usize {
    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}/history"))
        .reply(routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("json body");
    body["actionHistory"].as_array().expect("history").len()
}

fn first_pawn_id(state: &Value) -> u64 {
    state["view"]["tree"]["children"][0]["children"]
        .as_array()
        .expect("track children")
        .iter()
        .find(|c| c["kind"] == "pawn" && c["owner"] == json!(1))
        .and_then(|c| c["id"].as_u64())
        .expect("pawn id")
}

#[tokio::test]
async fn one_shot_action_round_trip() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_game(&routes).await;

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}?player=1"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("state body");
    let pawn = first_pawn_id(&body["state"]);
    assert_eq!(body["state"]["isMyTurn"], json!(true));

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/action"))
        .json(&json!({
            "action": "advance",
            "player": 1,
            "args": { "piece": { "__elementId": pawn } }
        }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("action body");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["flowState"]["currentPlayer"], json!(2));
    assert_eq!(body["state"]["animationEvents"][0]["name"], json!("pawnMoved"));

    assert_eq!(history_len(&routes, &game_id).await, 1);
}

#[tokio::test]
async fn illegal_action_is_rejected_without_side_effects() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_game(&routes).await;

    // Seat 2 acts while it is seat 1's turn.
    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/action"))
        .json(&json!({ "action": "noop", "player": 2, "args": {} }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(response.body()).expect("error body");
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["errorCode"], json!("ILLEGAL_ACTION"));

    assert_eq!(history_len(&routes, &game_id).await, 0);
}

#[tokio::test]
async fn missing_game_is_not_found() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);

    let response = warp::test::request()
        .method("GET")
        .path("/games/nope")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(response.body()).expect("error body");
    assert_eq!(body["errorCode"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn two_step_selection_flow_commits_once() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_game(&routes).await;

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/start-action"))
        .json(&json!({ "action": "move", "player": 1 }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("start body");
    let next = &body["pendingState"]["nextSelection"];
    assert_eq!(next["name"], json!("piece"));
    let pawn = next["choices"]["validElements"][0].as_u64().expect("pawn choice");

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/selection-step"))
        .json(&json!({
            "player": 1,
            "selection": "piece",
            "value": { "__elementId": pawn }
        }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("step body");
    assert_eq!(body["done"], json!(false));
    assert_eq!(body["nextChoices"]["name"], json!("destination"));
    let destination = body["nextChoices"]["choices"]["choices"][0].clone();

    // Nothing committed yet.
    assert_eq!(history_len(&routes, &game_id).await, 0);

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/selection-step"))
        .json(&json!({
            "player": 1,
            "selection": "destination",
            "value": destination
        }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("final step body");
    assert_eq!(body["done"], json!(true));
    assert_eq!(body["actionComplete"], json!(true));

    assert_eq!(history_len(&routes, &game_id).await, 1);
}

#[tokio::test]
async fn canceled_selection_never_touches_the_engine() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_game(&routes).await;

    warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/start-action"))
        .json(&json!({ "action": "move", "player": 1 }))
        .reply(&routes)
        .await;

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/cancel-action"))
        .json(&json!({ "player": 1 }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("cancel body");
    assert_eq!(body["canceled"], json!(true));

    assert_eq!(history_len(&routes, &game_id).await, 0);

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}/pending-action?player=1"))
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(response.body()).expect("pending body");
    assert_eq!(body["pendingState"], Value::Null);
}

#[tokio::test]
async fn undo_and_time_travel_round_trip() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);
    let game_id = create_game(&routes).await;

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}?player=1"))
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(response.body()).expect("state");
    let pawn = first_pawn_id(&body["state"]);

    warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/action"))
        .json(&json!({
            "action": "advance",
            "player": 1,
            "args": { "piece": { "__elementId": pawn } }
        }))
        .reply(&routes)
        .await;

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}/state-at/0?player=1"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = warp::test::request()
        .method("GET")
        .path(&format!("/games/{game_id}/state-diff?from=0&to=1&player=1"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("diff body");
    assert!(body["diff"].as_object().map(|d| !d.is_empty()).unwrap_or(false));

    let response = warp::test::request()
        .method("POST")
        .path(&format!("/games/{game_id}/undo"))
        .json(&json!({ "player": 1 }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(history_len(&routes, &game_id).await, 0);
}

#[tokio::test]
async fn health_reports_ok() {
    let ctx = AppContext::new_for_tests();
    let routes = WebServer::routes(&ctx);

    let response = warp::test::request().method("GET").path("/health").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).expect("health body");
    assert_eq!(body["status"], json!("ok"));
}
