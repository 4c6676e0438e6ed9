pub mod epoll;
