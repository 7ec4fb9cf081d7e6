//! Conformance suite over the in-memory transport.

use quartet::core::Transport;
use quartet_testkit::{TestError, TransportFactory};

struct MemFactory;

impl TransportFactory for MemFactory {
    async fn connect_pair() -> Result<(Transport, Transport), TestError> {
        Ok(Transport::mem_pair())
    }
}

#[tokio::test]
async fn sum_adds_with_wrapping() {
    quartet_testkit::run_sum::<MemFactory>().await;
}

#[tokio::test]
async fn square_root_rejects_negative_input() {
    quartet_testkit::run_square_root::<MemFactory>().await;
}

#[tokio::test]
async fn prime_number_streams_the_factorization() {
    quartet_testkit::run_prime_number_stream::<MemFactory>().await;
}

#[tokio::test]
async fn prime_number_below_two_is_an_empty_stream() {
    quartet_testkit::run_prime_number_below_two_is_empty::<MemFactory>().await;
}

#[tokio::test]
async fn average_aggregates_the_whole_stream() {
    quartet_testkit::run_average::<MemFactory>().await;
}

#[tokio::test]
async fn average_of_nothing_is_nan() {
    quartet_testkit::run_average_of_nothing_is_nan::<MemFactory>().await;
}

#[tokio::test]
async fn find_max_emits_strictly_increasing_maxima() {
    quartet_testkit::run_find_max::<MemFactory>().await;
}

#[tokio::test]
async fn duplex_cancel_unblocks_the_receiver() {
    quartet_testkit::run_duplex_cancel::<MemFactory>().await;
}

#[tokio::test]
async fn greet_answers_by_first_name() {
    quartet_testkit::run_greet::<MemFactory>().await;
}

#[tokio::test]
async fn greet_many_times_numbers_its_greetings() {
    quartet_testkit::run_greet_many_times::<MemFactory>().await;
}

#[tokio::test]
async fn long_greet_concatenates_every_name() {
    quartet_testkit::run_long_greet::<MemFactory>().await;
}

#[tokio::test]
async fn greet_all_echoes_one_greeting_per_name() {
    quartet_testkit::run_greet_all::<MemFactory>().await;
}

#[tokio::test(start_paused = true)]
async fn greet_with_a_generous_deadline_succeeds() {
    quartet_testkit::run_greet_with_deadline_ok::<MemFactory>().await;
}

#[tokio::test(start_paused = true)]
async fn greet_with_a_short_deadline_is_deadline_exceeded() {
    quartet_testkit::run_greet_with_deadline_exceeded::<MemFactory>().await;
}

#[tokio::test]
async fn records_crud_round_trips() {
    quartet_testkit::run_record_crud::<MemFactory>().await;
}

#[tokio::test]
async fn record_errors_carry_precise_codes() {
    quartet_testkit::run_record_errors::<MemFactory>().await;
}

#[tokio::test]
async fn list_records_streams_in_insertion_order() {
    quartet_testkit::run_list_records::<MemFactory>().await;
}

#[tokio::test]
async fn half_close_walks_the_channel_lifecycle() {
    quartet_testkit::run_half_close_lifecycle::<MemFactory>().await;
}

#[tokio::test]
async fn unknown_methods_are_unimplemented() {
    quartet_testkit::run_unknown_method_is_unimplemented::<MemFactory>().await;
}
