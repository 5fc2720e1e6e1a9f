mod channel;
mod client_handler;
mod server_handler;

pub use server_handler::PiperHandler;
