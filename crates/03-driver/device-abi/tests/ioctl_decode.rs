use device_abi::{request, DeviceError, Ioctl, IoctlPayload};
use proptest::prelude::*;

const REQUESTS: [u64; 13] = [
    request::VIDIOC_QUERYCAP,
    request::VIDIOC_G_FMT,
    request::VIDIOC_S_FMT,
    request::VIDIOC_REQBUFS,
    request::VIDIOC_QUERYBUF,
    request::VIDIOC_QBUF,
    request::VIDIOC_DQBUF,
    request::VIDIOC_STREAMON,
    request::VIDIOC_STREAMOFF,
    request::VIDIOC_S_PARM,
    request::VIDIOC_G_CTRL,
    request::VIDIOC_S_EXT_CTRLS,
    request::VIDIOC_DQEVENT,
];

proptest! {
    #[test]
    fn garbage_payloads_fail_as_protocol_errors(
        which in 0usize..REQUESTS.len(),
        data in proptest::collection::vec(any::<u8>(), 0..96),
        planes in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..96)),
    ) {
        let payload = IoctlPayload { request: REQUESTS[which], data, planes };
        match Ioctl::from_payload(&payload) {
            Ok(cmd) => prop_assert_eq!(cmd.request(), payload.request),
            Err(err) => prop_assert!(matches!(err, DeviceError::Protocol(_))),
        }
    }

    #[test]
    fn unknown_requests_are_never_decoded(code in any::<u64>()) {
        prop_assume!(!REQUESTS.contains(&code));
        let payload = IoctlPayload { request: code, data: Vec::new(), planes: None };
        prop_assert!(matches!(Ioctl::from_payload(&payload), Err(DeviceError::Protocol(_))));
    }
}
