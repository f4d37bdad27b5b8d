//! Per-seat view masking across game actions.

use gametable_engine::games::pawns::PawnsFactory;
use gametable_engine::{
    create_all_player_views, create_player_view, ActionArgs, GameEngine, GameFactory, GameSetup,
};
use serde_json::{json, Value};

fn new_game() -> Box<dyn GameEngine> {
    PawnsFactory
        .create(&GameSetup::new(101, vec!["A".into(), "B".into(), "C".into()]))
        .expect("create game")
}

fn hand_node(view_tree: &Value, owner: u64) -> Value {
    view_tree["children"]
        .as_array()
        .expect("children")
        .iter()
        .find(|c| c["kind"] == "hand" && c["owner"] == json!(owner))
        .cloned()
        .expect("hand node")
}

#[test]
fn each_seat_sees_only_its_own_hand() {
    let game = new_game();
    let views = create_all_player_views(game.as_ref());
    assert_eq!(views.len(), 3);

    for (index, view) in views.iter().enumerate() {
        let own_seat = (index + 1) as u64;
        for owner in 1..=3u64 {
            let hand = hand_node(&view.tree, owner);
            if owner == own_seat {
                assert!(hand.get("__hidden").is_none(), "seat {own_seat} sees its hand");
                // The card inside is visible too, with its rank.
                assert!(hand["children"][0]["attributes"]["rank"].is_u64());
            } else {
                assert_eq!(hand["__hidden"], json!(true));
                assert!(hand.get("children").is_none(), "hidden contents are redacted");
            }
        }
    }
}

#[test]
fn board_is_public_to_spectators() {
    let game = new_game();
    let view = create_player_view(game.as_ref(), None);
    assert_eq!(view.seat, None);

    let track = view.tree["children"][0].clone();
    assert_eq!(track["kind"], json!("board"));
    assert!(track.get("__hidden").is_none());
    assert_eq!(track["attributes"]["len"], json!(8));
    // Pawns on the board are visible with their positions.
    let pawns = track["children"].as_array().expect("pawns");
    assert_eq!(pawns.len(), 6);
    assert!(pawns.iter().all(|p| p["attributes"]["pos"] == json!(0)));
}

#[test]
fn reveal_makes_a_hand_public_in_every_view() {
    let mut game = new_game();
    game.perform_action("reveal", 1, &ActionArgs::new()).expect("reveal");

    for seat in [Some(2), Some(3), None] {
        let view = create_player_view(game.as_ref(), seat);
        let hand = hand_node(&view.tree, 1);
        assert!(hand.get("__hidden").is_none(), "revealed hand visible to {seat:?}");
    }

    // The other hands stay private.
    let view = create_player_view(game.as_ref(), None);
    assert_eq!(hand_node(&view.tree, 2)["__hidden"], json!(true));
}

#[test]
fn views_carry_phase_and_turn() {
    let mut game = new_game();
    let view = create_player_view(game.as_ref(), Some(1));
    assert_eq!(view.phase, "playing");
    assert_eq!(view.current_player, Some(1));

    game.perform_action("noop", 1, &ActionArgs::new()).expect("noop");
    let view = create_player_view(game.as_ref(), Some(1));
    assert_eq!(view.current_player, Some(2));
}
