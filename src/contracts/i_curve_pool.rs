use ethers::prelude::abigen;

abigen!(
    ICurvePool,
    r#"[
        function get_dy(int128 i, int128 j, uint256 dx) external view returns (uint256)
        function coins(uint256 i) external view returns (address)
        function is_killed() external view returns (bool)
    ]"#
);
