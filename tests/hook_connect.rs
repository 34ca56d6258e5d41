//! Hooked connect scenarios, isolated in their own process because they
//! adjust the process-wide connect-timeout knob.

use spindle::{IoManager, hook, util};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn listener(backlog: i32) -> (RawFd, libc::sockaddr_in) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 0;
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
        let rt = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rt, 0);
        assert_eq!(libc::listen(fd, backlog), 0);
        let mut bound: libc::sockaddr_in = std::mem::zeroed();
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        libc::getsockname(
            fd,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        );
        (fd, bound)
    }
}

#[test]
fn connect_to_live_listener_succeeds() {
    let (listen_fd, addr) = listener(16);
    let iom = IoManager::new(1, false, "conn-ok").unwrap();
    let result: Arc<Mutex<Option<(i32, i32)>>> = Arc::new(Mutex::new(None));
    {
        let result = result.clone();
        iom.schedule_fn(move || {
            hook::set_hook_enable(true);
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let rt = unsafe {
                hook::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            *result.lock().unwrap() = Some((rt, util::errno()));
            hook::close(fd);
        });
    }
    std::thread::sleep(Duration::from_millis(500));
    iom.stop();

    let (rt, err) = result.lock().unwrap().expect("connector never ran");
    assert_eq!(rt, 0, "loopback connect failed with errno {err}");
    unsafe { libc::close(listen_fd) };
}

#[test]
fn connect_times_out_against_a_saturated_backlog() {
    let (listen_fd, addr) = listener(1);

    // Saturate the accept queue so further handshakes stall silently.
    let mut fillers = Vec::new();
    for _ in 0..3 {
        unsafe {
            let fd = libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
            );
            assert!(fd >= 0);
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            fillers.push(fd);
        }
    }
    std::thread::sleep(Duration::from_millis(100));

    hook::set_tcp_connect_timeout(Some(500));
    let iom = IoManager::new(1, false, "conn-to").unwrap();
    let result: Arc<Mutex<Option<(i32, i32, u64, bool)>>> = Arc::new(Mutex::new(None));
    {
        let result = result.clone();
        iom.schedule_fn(move || {
            hook::set_hook_enable(true);
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let t0 = util::current_ms();
            let rt = unsafe {
                hook::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            let err = util::errno();
            let elapsed = util::current_ms() - t0;
            // The fd must survive the timeout.
            let still_open = unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1;
            *result.lock().unwrap() = Some((rt, err, elapsed, still_open));
        });
    }
    std::thread::sleep(Duration::from_millis(1500));

    let outcome = result.lock().unwrap().expect("connector never returned");
    match outcome {
        (0, _, _, _) => {
            // The fabric accepted the handshake anyway; the timeout path
            // cannot be exercised here.
            eprintln!("backlog not saturated on this host, skipping");
        }
        (-1, libc::ETIMEDOUT, elapsed, still_open) => {
            assert!(
                (350..1200).contains(&elapsed),
                "timed out after {elapsed} ms"
            );
            assert!(still_open, "timeout must not close the fd");
            assert_eq!(iom.pending_events(), 0, "WRITE registration must be gone");
        }
        (rt, err, _, _) => {
            eprintln!("connect returned ({rt}, errno {err}) on this host, skipping");
        }
    }

    iom.stop();
    hook::set_tcp_connect_timeout(Some(5000));
    for fd in fillers {
        unsafe { libc::close(fd) };
    }
    unsafe { libc::close(listen_fd) };
}
