pub mod block_requests;
