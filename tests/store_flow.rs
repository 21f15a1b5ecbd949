//! End-to-end flows through the store task and the room registry, the way
//! the connection handlers drive them.

use pongsrv::auth;
use pongsrv::data::{AcceptOutcome, Difficulty, GameOutcome, GameStatus, MatchStatus, Side};
use pongsrv::db_task::{self, Store};
use pongsrv::game::{check_match_end, step, Registry, RoomStatus, POINTS_TO_WIN_MATCH};
use pongsrv::messages::QueueReport;

async fn store_with_players() -> (Store, i64, i64) {
    let store = db_task::run(":memory:").unwrap();
    let alice = store.create_user("alice", "alice.png").await.unwrap();
    let bob = store.create_user("bob", "bob.png").await.unwrap();
    (store, alice, bob)
}

#[tokio::test]
async fn queued_players_are_paired_into_a_waiting_game() {
    let (store, alice, bob) = store_with_players().await;

    assert!(matches!(
        store
            .join_queue(alice, Some(Difficulty::Medium))
            .await
            .unwrap(),
        QueueReport::InQueue { position: 1, .. }
    ));
    assert!(matches!(
        store
            .join_queue(bob, Some(Difficulty::Medium))
            .await
            .unwrap(),
        QueueReport::InQueue { position: 2, .. }
    ));

    let made = store.find_matches().await.unwrap();
    assert_eq!(made.len(), 1);
    assert_eq!(made[0].player1.username, "alice");
    assert_eq!(made[0].player2.username, "bob");

    let game = store.get_game(made[0].game_id).await.unwrap().unwrap();
    assert_eq!(game.status, GameStatus::Waiting);
    assert_eq!((game.player1, game.player2), (alice, bob));
    assert_eq!(game.difficulty, Difficulty::Medium);

    // being matched removes both players from the queue
    assert!(matches!(
        store.queue_status(alice).await.unwrap(),
        QueueReport::NotInQueue
    ));
    assert!(!store.in_queue(bob).await.unwrap());

    // a second pass has nothing left to pair
    assert!(store.find_matches().await.unwrap().is_empty());
}

#[tokio::test]
async fn accepted_invitation_feeds_the_same_game_path() {
    let (store, alice, bob) = store_with_players().await;

    store
        .create_invitation(alice, bob, Difficulty::Hard, "AB12CD34")
        .await
        .unwrap();

    let game_id = match store.accept_invitation("AB12CD34").await.unwrap() {
        AcceptOutcome::Created(game_id) => game_id,
        other => panic!("unexpected outcome {other:?}"),
    };

    let game = store.get_game(game_id).await.unwrap().unwrap();
    assert_eq!((game.player1, game.player2), (alice, bob));
    assert_eq!(game.difficulty, Difficulty::Hard);
    assert_eq!(game.status, GameStatus::Waiting);

    match store.accept_invitation("AB12CD34").await.unwrap() {
        AcceptOutcome::AlreadyAccepted(existing) => assert_eq!(existing, game_id),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn finished_game_lands_in_history_with_profiles() {
    let (store, alice, bob) = store_with_players().await;
    store.join_queue(alice, None).await.unwrap();
    store.join_queue(bob, None).await.unwrap();
    let game_id = store.find_matches().await.unwrap()[0].game_id;
    store.mark_game_started(game_id).await.unwrap();

    store.start_match(game_id, 1).await.unwrap();
    store
        .complete_match(game_id, 1, 5, 3, Side::Player2)
        .await
        .unwrap();
    store.start_match(game_id, 2).await.unwrap();
    store
        .complete_match(game_id, 2, 5, 1, Side::Player2)
        .await
        .unwrap();
    store.start_match(game_id, 3).await.unwrap();

    assert!(store
        .finalize_game(GameOutcome {
            game_id,
            winner: Some(Side::Player2),
            match_wins_player1: 0,
            match_wins_player2: 3,
            current_match: 3,
            current_score_player1: 2,
            current_score_player2: 5,
            game_over: true,
        })
        .await
        .unwrap());

    let game = store.get_game(game_id).await.unwrap().unwrap();
    assert_eq!(game.status, GameStatus::Completed);
    assert_eq!(game.winner, Some(bob));
    assert_eq!(game.final_score_player2, 3);

    let matches = store.get_matches(game_id).await.unwrap();
    assert_eq!(matches.len(), 3);
    assert!(matches.iter().all(|m| m.status == MatchStatus::Completed));
    assert!(matches.iter().all(|m| m.winner == Some(Side::Player2)));

    let winner = store.get_or_create_profile(bob).await.unwrap();
    assert_eq!(winner.matches_won, 1);
    assert_eq!(winner.experience, 500);
    assert!(winner.first_win && winner.pure_win);

    let loser = store.get_or_create_profile(alice).await.unwrap();
    assert_eq!(loser.matches_lost, 1);
    assert_eq!(loser.experience, 100);
}

#[tokio::test]
async fn tokens_resolve_to_users_or_reject() {
    let (store, alice, _bob) = store_with_players().await;
    store.create_session("tok-alice", alice).await.unwrap();

    assert_eq!(auth::authenticate(&store, Some("tok-alice")).await, Some(alice));
    assert_eq!(auth::authenticate(&store, Some("tok-bogus")).await, None);
    assert_eq!(auth::authenticate(&store, Some("")).await, None);
    assert_eq!(auth::authenticate(&store, None).await, None);
}

#[tokio::test]
async fn room_runs_from_pairing_to_a_match_result() {
    let (store, _alice, _bob) = store_with_players().await;
    store.join_queue(_alice, None).await.unwrap();
    store.join_queue(_bob, None).await.unwrap();
    let game_id = store.find_matches().await.unwrap()[0].game_id;
    let game = store.get_game(game_id).await.unwrap().unwrap();

    let registry = Registry::new();
    let room = registry.get_or_create(&game).await;

    {
        let mut state = room.lock().await;
        assert_eq!(state.game_status, RoomStatus::Waiting);

        let change = state.set_connection(Side::Player1, true);
        assert!(!change.both_connected);
        let change = state.set_connection(Side::Player2, true);
        assert!(change.status_changed);
        assert_eq!(state.game_status, RoomStatus::Menu);

        state.start_playing();
        assert_eq!(state.game_status, RoomStatus::Playing);

        // park the left paddle so misses accumulate into a match result
        state.left_paddle.y = 0.0;
        let mut ticks: u64 = 0;
        loop {
            step(&mut state, 1.0 / 240.0);
            ticks += 1;
            assert!(ticks < 2_000_000, "match should finish");
            if check_match_end(&mut state) {
                break;
            }
        }
        assert!(matches!(
            state.game_status,
            RoomStatus::MatchOver | RoomStatus::GameOver
        ));
        assert!(state.winner.is_some());
        assert_eq!(
            state.left_paddle.score.max(state.right_paddle.score),
            POINTS_TO_WIN_MATCH
        );
    }

    assert!(registry.get(game_id).await.is_some());
    let _ = registry.delete(game_id).await;
    assert!(registry.get(game_id).await.is_none());
}
