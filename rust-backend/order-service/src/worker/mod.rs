pub mod reservation_sweeper;

pub use reservation_sweeper::{start_reservation_sweeper, ReservationSweeper};
